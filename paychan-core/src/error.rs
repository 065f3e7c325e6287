#[cfg(feature = "use_backtrace")]
use backtrace::Backtrace;

use crate::prelude::*;
use ChannelErrorKind::*;

/// Kind of channel error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelErrorKind {
    /// The channel is failed and rejects new handshakes
    Failed,
    /// The channel is closed on-chain
    Closed,
    /// A caller-supplied argument is invalid
    InvalidArgument,
    /// The asset sub-ledger is not reachable
    NotReachable,
    /// The funding output is not yet confirmed
    Unconfirmed,
    /// The balance would fall below the minimum output
    InsufficientFunds,
    /// The HTLC locktime has not been reached
    LocktimeNotExpired,
    /// The peer did not answer in time
    Timeout,
    /// The peer deferred our proposal; it may be retried
    Deferred,
    /// The peer violated the update protocol
    Protocol,
    /// The persister failed
    Persist,
    /// A revocation secret is inconsistent with the received chain
    ChainMismatch,
    /// A key derivation path is invalid
    InvalidPath,
    /// An on-chain transaction could not be reconstructed
    Reconstruction,
    /// Bytes could not be decoded
    Decode,
    /// The transport could not deliver a message
    Transport,
    /// An internal invariant did not hold
    Internal,
}

/// Channel error
#[derive(Clone)]
pub struct ChannelError {
    /// The kind of error
    pub kind: ChannelErrorKind,
    /// Description
    pub msg: String,
    /// A non-resolved backtrace
    #[cfg(feature = "use_backtrace")]
    pub bt: Backtrace,
}

// Explicit PartialEq which ignores backtrace.
impl PartialEq for ChannelError {
    fn eq(&self, other: &ChannelError) -> bool {
        self.kind == other.kind && self.msg == other.msg
    }
}

impl ChannelError {
    /// Create an error, logging it
    pub fn new(kind: ChannelErrorKind, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match kind {
            Deferred | Closed | InvalidArgument | LocktimeNotExpired | NotReachable
            | Unconfirmed | InsufficientFunds => log::warn!("{:?}: {}", kind, msg),
            _ => log::error!("{:?}: {}", kind, msg),
        }
        ChannelError {
            kind,
            msg,
            #[cfg(feature = "use_backtrace")]
            bt: Backtrace::new_unresolved(),
        }
    }

    /// Resolve the backtrace for display to the user
    #[cfg(feature = "use_backtrace")]
    pub fn resolved_backtrace(&self) -> Backtrace {
        let mut mce = self.clone();
        mce.bt.resolve();
        mce.bt
    }

    /// Return a new ChannelError with the message prepended
    pub fn prepend_msg(&self, premsg: String) -> ChannelError {
        ChannelError {
            kind: self.kind,
            msg: premsg + &self.msg,
            #[cfg(feature = "use_backtrace")]
            bt: self.bt.clone(),
        }
    }

    /// Whether this error leaves the channel failed
    pub fn is_fatal(&self) -> bool {
        match self.kind {
            Failed | Protocol | Persist | Timeout | ChainMismatch | Transport | Internal => true,
            _ => false,
        }
    }
}

impl core::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.msg)
    }
}

impl core::fmt::Debug for ChannelError {
    #[cfg(not(feature = "use_backtrace"))]
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("ChannelError").field("kind", &self.kind).field("msg", &self.msg).finish()
    }
    #[cfg(feature = "use_backtrace")]
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("ChannelError")
            .field("kind", &self.kind)
            .field("msg", &self.msg)
            .field("bt", &self.resolved_backtrace())
            .finish()
    }
}

impl std::error::Error for ChannelError {}

impl Into<String> for ChannelError {
    fn into(self) -> String {
        let prefix = match self.kind {
            Failed => "channel failed",
            Closed => "channel closed",
            InvalidArgument => "invalid argument",
            NotReachable => "asset not reachable",
            Unconfirmed => "channel not confirmed",
            InsufficientFunds => "insufficient funds",
            LocktimeNotExpired => "locktime not expired",
            Timeout => "timed out",
            Deferred => "deferred by peer",
            Protocol => "protocol violation",
            Persist => "persistence failure",
            ChainMismatch => "revocation chain mismatch",
            InvalidPath => "invalid key path",
            Reconstruction => "reconstruction mismatch",
            Decode => "decode failure",
            Transport => "transport failure",
            Internal => "internal error",
        };
        format!("{}: {}", prefix, self.msg)
    }
}

impl From<crate::persist::Error> for ChannelError {
    fn from(e: crate::persist::Error) -> Self {
        ChannelError::new(Persist, format!("{:?}", e))
    }
}

impl From<bitcoin::secp256k1::Error> for ChannelError {
    fn from(e: bitcoin::secp256k1::Error) -> Self {
        ChannelError::new(Internal, format!("secp256k1: {}", e))
    }
}

pub(crate) fn failed_error(msg: impl Into<String>) -> ChannelError {
    ChannelError::new(Failed, msg)
}

pub(crate) fn protocol_error(msg: impl Into<String>) -> ChannelError {
    ChannelError::new(Protocol, msg)
}

pub(crate) fn invalid_argument_error(msg: impl Into<String>) -> ChannelError {
    ChannelError::new(InvalidArgument, msg)
}

pub(crate) fn internal_error(msg: impl Into<String>) -> ChannelError {
    ChannelError::new(Internal, msg)
}

/// Return an error of the given kind from the current function
#[doc(hidden)]
#[macro_export]
macro_rules! channel_err {
	($kind:ident, $($arg:tt)*) => (
            return Err($crate::error::ChannelError::new(
                $crate::error::ChannelErrorKind::$kind,
                format!("{}: {}", short_function!(), format!($($arg)*)),
            ))
        )
}

/// Build, without returning, an error of the given kind prefixed by the current function
#[doc(hidden)]
#[macro_export]
macro_rules! channel_error {
	($kind:ident, $($arg:tt)*) => (
            $crate::error::ChannelError::new(
                $crate::error::ChannelErrorKind::$kind,
                format!("{}: {}", short_function!(), format!($($arg)*)),
            )
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn rejects(amount: i64) -> Result<(), ChannelError> {
        if amount <= 0 {
            channel_err!(InvalidArgument, "amount {} not positive", amount);
        }
        Ok(())
    }

    #[test]
    fn channel_err_macro_test() {
        let err = rejects(0).unwrap_err();
        assert_eq!(err.kind, InvalidArgument);
        assert_eq!(err.msg, "rejects: amount 0 not positive");
        assert!(rejects(1).is_ok());
        assert!(!err.is_fatal());
    }

    #[test]
    fn into_string_test() {
        let err = failed_error("boom").prepend_msg("chan 7: ".to_string());
        let s: String = err.clone().into();
        assert_eq!(s, "channel failed: chan 7: boom");
        assert!(err.is_fatal());
        assert_eq!(format!("{}", err), "Failed: chan 7: boom");
    }

    #[test]
    fn persist_error_converts_test() {
        let err: ChannelError = crate::persist::Error::NotFound("x".to_string()).into();
        assert_eq!(err.kind, Persist);
    }
}
