//! Handshake state machine for bidirectional streams.
//!
//! The first inbound message of a session must be its config. Every later
//! data message is admitted with the config snapshot current at that moment.
//! The machine is pure: it performs no I/O and can be driven message by
//! message.

use crate::{
    Admitted, CONFIG_MUST_PRECEDE_DATA, Error, Result, STREAM_ENDED_BEFORE_CONFIG, Sequencer,
};
use core::str::FromStr;
use std::sync::Arc;

/// One inbound message of a session, as far as the handshake is concerned.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionMessage<T, C> {
    Config(C),
    Item(T),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingConfig,
    Active,
    Closed,
    Failed,
}

/// What to do with a config that arrives after the session is active.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReconfigPolicy {
    /// Fail the session with a protocol error.
    #[default]
    Reject,
    /// Use the new config for items admitted from now on. Items already
    /// admitted keep the snapshot they were admitted with.
    ApplyToSubsequent,
}

impl FromStr for ReconfigPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "apply" | "apply_to_subsequent" => Ok(Self::ApplyToSubsequent),
            other => Err(format!(
                "unknown reconfig policy '{other}' (expected reject or apply)"
            )),
        }
    }
}

/// Result of feeding one message to a session.
#[derive(Debug)]
pub enum Accepted<T, C> {
    /// The handshake completed with this config.
    Configured(Arc<C>),
    /// A later config replaced the active snapshot.
    Reconfigured(Arc<C>),
    /// A data message was admitted.
    Admitted(Admitted<T, C>),
}

#[derive(Debug)]
pub struct StreamSession<C> {
    phase: SessionPhase,
    config: Option<Arc<C>>,
    sequencer: Sequencer,
    policy: ReconfigPolicy,
    reconfigurations: u64,
}

impl<C> Default for StreamSession<C> {
    fn default() -> Self {
        Self::new(ReconfigPolicy::default())
    }
}

impl<C> StreamSession<C> {
    pub const fn new(policy: ReconfigPolicy) -> Self {
        Self {
            phase: SessionPhase::AwaitingConfig,
            config: None,
            sequencer: Sequencer::new(),
            policy,
            reconfigurations: 0,
        }
    }

    pub const fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub const fn config(&self) -> Option<&Arc<C>> {
        self.config.as_ref()
    }

    /// Number of data messages admitted so far.
    pub const fn admitted(&self) -> u64 {
        self.sequencer.admitted()
    }

    pub const fn reconfigurations(&self) -> u64 {
        self.reconfigurations
    }

    /// Feeds one inbound message to the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] when data arrives before the config, when
    /// a second config arrives under [`ReconfigPolicy::Reject`], or when the
    /// session is no longer open. The session is left `Failed` in the first
    /// two cases.
    pub fn accept<T>(&mut self, message: SessionMessage<T, C>) -> Result<Accepted<T, C>> {
        match (self.phase, message) {
            (SessionPhase::AwaitingConfig, SessionMessage::Config(config)) => {
                let config = Arc::new(config);
                self.config = Some(Arc::clone(&config));
                self.phase = SessionPhase::Active;
                Ok(Accepted::Configured(config))
            }
            (SessionPhase::AwaitingConfig, SessionMessage::Item(_)) => {
                Err(self.fail_with(CONFIG_MUST_PRECEDE_DATA))
            }
            (SessionPhase::Active, SessionMessage::Item(input)) => {
                let Some(config) = self.config.as_ref().map(Arc::clone) else {
                    return Err(self.fail_with("active session has no config"));
                };
                let item = self.sequencer.admit(input);
                Ok(Accepted::Admitted(Admitted::new(item, config)))
            }
            (SessionPhase::Active, SessionMessage::Config(config)) => match self.policy {
                ReconfigPolicy::Reject => Err(self.fail_with("config already received")),
                ReconfigPolicy::ApplyToSubsequent => {
                    let config = Arc::new(config);
                    self.config = Some(Arc::clone(&config));
                    self.reconfigurations += 1;
                    Ok(Accepted::Reconfigured(config))
                }
            },
            (SessionPhase::Closed, _) => Err(Error::protocol("session is closed")),
            (SessionPhase::Failed, _) => Err(Error::protocol("session has failed")),
        }
    }

    /// Ends the session after the last inbound message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the stream ended before a config was
    /// received, or if the session was already closed or failed.
    pub fn close(&mut self) -> Result<()> {
        match self.phase {
            SessionPhase::Active => {
                self.phase = SessionPhase::Closed;
                Ok(())
            }
            SessionPhase::AwaitingConfig => Err(self.fail_with(STREAM_ENDED_BEFORE_CONFIG)),
            SessionPhase::Closed => Err(Error::protocol("session is closed")),
            SessionPhase::Failed => Err(Error::protocol("session has failed")),
        }
    }

    /// Marks the session failed, e.g. after a transport error.
    pub fn fail(&mut self) {
        self.phase = SessionPhase::Failed;
    }

    fn fail_with(&mut self, reason: &str) -> Error {
        self.fail();
        Error::protocol(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Msg = SessionMessage<&'static str, u32>;

    #[test]
    fn config_then_items_are_admitted_in_order() {
        let mut session = StreamSession::default();
        assert!(matches!(
            session.accept(Msg::Config(1)),
            Ok(Accepted::Configured(c)) if *c == 1
        ));
        assert_eq!(session.phase(), SessionPhase::Active);

        for expected in 0..3 {
            let Ok(Accepted::Admitted(admitted)) = session.accept(Msg::Item("tle")) else {
                panic!("item not admitted");
            };
            assert_eq!(admitted.item.index(), expected);
            assert_eq!(*admitted.params, 1);
        }
        assert_eq!(session.admitted(), 3);

        session.close().unwrap();
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert!(session.accept(Msg::Item("late")).is_err());
    }

    #[test]
    fn data_before_config_fails_the_session() {
        let mut session = StreamSession::<u32>::default();
        let err = session.accept(Msg::Item("tle")).unwrap_err();
        assert_eq!(err, Error::protocol(CONFIG_MUST_PRECEDE_DATA));
        assert_eq!(session.phase(), SessionPhase::Failed);
        assert!(session.accept(Msg::Config(1)).is_err());
        assert_eq!(session.admitted(), 0);
    }

    #[test]
    fn second_config_is_rejected_by_default() {
        let mut session = StreamSession::default();
        session.accept(Msg::Config(1)).unwrap();
        let err = session.accept(Msg::Config(2)).unwrap_err();
        assert!(err.is_protocol());
        assert_eq!(session.phase(), SessionPhase::Failed);
    }

    #[test]
    fn second_config_applies_to_later_items_when_allowed() {
        let mut session = StreamSession::new(ReconfigPolicy::ApplyToSubsequent);
        session.accept(Msg::Config(1)).unwrap();
        let Ok(Accepted::Admitted(first)) = session.accept(Msg::Item("a")) else {
            panic!("item not admitted");
        };
        assert!(matches!(
            session.accept(Msg::Config(2)),
            Ok(Accepted::Reconfigured(_))
        ));
        let Ok(Accepted::Admitted(second)) = session.accept(Msg::Item("b")) else {
            panic!("item not admitted");
        };

        assert_eq!(*first.params, 1);
        assert_eq!(*second.params, 2);
        assert_eq!(second.item.index(), 1);
        assert_eq!(session.reconfigurations(), 1);
    }

    #[test]
    fn closing_before_config_is_a_protocol_error() {
        let mut session = StreamSession::<u32>::default();
        assert!(session.close().unwrap_err().is_protocol());
        assert_eq!(session.phase(), SessionPhase::Failed);
    }

    #[test]
    fn reconfig_policy_parses() {
        assert_eq!("reject".parse::<ReconfigPolicy>(), Ok(ReconfigPolicy::Reject));
        assert_eq!("Apply".parse::<ReconfigPolicy>(), Ok(ReconfigPolicy::ApplyToSubsequent));
        assert!("maybe".parse::<ReconfigPolicy>().is_err());
    }
}
