use std::sync::Arc;

/// One unit of input plus the sequence index assigned when it was admitted.
///
/// The index is the only reliable way to map an outcome back to its input:
/// outcomes complete in any order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem<T> {
    index: u64,
    input: T,
}

impl<T> WorkItem<T> {
    pub const fn new(index: u64, input: T) -> Self {
        Self { index, input }
    }

    pub const fn index(&self) -> u64 {
        self.index
    }

    pub const fn input(&self) -> &T {
        &self.input
    }

    pub fn into_input(self) -> T {
        self.input
    }
}

/// Hands out admission indices: unique and increasing in admission order,
/// starting at zero for every job.
#[derive(Debug, Default)]
pub struct Sequencer {
    next: u64,
}

impl Sequencer {
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    /// Wraps `input` into a [`WorkItem`] carrying the next index.
    pub fn admit<T>(&mut self, input: T) -> WorkItem<T> {
        let index = self.next;
        self.next += 1;
        WorkItem::new(index, input)
    }

    /// Number of items admitted so far.
    pub const fn admitted(&self) -> u64 {
        self.next
    }
}

/// A work item paired with the parameters it must be computed with.
///
/// The params are a shared snapshot: every item of a bulk request points at
/// the same `Arc`, and streaming sessions hand out whichever config was
/// current when the item arrived.
#[derive(Debug)]
pub struct Admitted<T, C> {
    pub item: WorkItem<T>,
    pub params: Arc<C>,
}

impl<T, C> Admitted<T, C> {
    pub const fn new(item: WorkItem<T>, params: Arc<C>) -> Self {
        Self { item, params }
    }
}

/// Admits every input of a bulk request against one shared params snapshot.
pub fn admit_all<T, C>(
    inputs: impl IntoIterator<Item = T>,
    params: Arc<C>,
) -> impl Iterator<Item = Admitted<T, C>> {
    let mut sequencer = Sequencer::new();
    inputs
        .into_iter()
        .map(move |input| Admitted::new(sequencer.admit(input), Arc::clone(&params)))
}

/// Identifies the input an outcome belongs to.
///
/// `index` is always present. `external_id` is whatever identifier the
/// provider could derive from the input itself (a catalog number, say).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub index: u64,
    pub external_id: Option<u64>,
}

impl CorrelationKey {
    pub const fn new(index: u64, external_id: Option<u64>) -> Self {
        Self { index, external_id }
    }
}
