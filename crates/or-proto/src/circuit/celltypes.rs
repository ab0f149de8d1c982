//! Wrapper types for subsets of the channel messages.
//!
//! These wrappers define types that are valid in response to
//! particular requests, or when received in particular circumstances.
//! They're used so that Rust's typesafety can help enforce protocol
//! properties.

use crate::{Error, Result};
use or_cell::chancell::msg::{self as chanmsg, AnyChanMsg};
use or_cell::chancell::ChanMsg;
use std::fmt::{self, Display};

/// A subclass of ChanMsg that can arrive in response to a CREATE*
/// cell that we send.
#[derive(Debug)]
pub(crate) enum CreateResponse {
    /// Destroy cell: the CREATE failed.
    Destroy(chanmsg::Destroy),
    /// Created: good response to a CREATE cell.
    Created(chanmsg::Created),
    /// CreatedFast: good response to a CREATE_FAST cell.
    CreatedFast(chanmsg::CreatedFast),
}

impl Display for CreateResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use CreateResponse as CR;
        match self {
            CR::Destroy(destroy) => write!(f, "DESTROY({})", destroy.reason()),
            CR::Created(_) => Display::fmt("CREATED", f),
            CR::CreatedFast(_) => Display::fmt("CREATED_FAST", f),
        }
    }
}

impl TryFrom<AnyChanMsg> for CreateResponse {
    type Error = crate::Error;

    fn try_from(m: AnyChanMsg) -> Result<CreateResponse> {
        match m {
            AnyChanMsg::Destroy(m) => Ok(CreateResponse::Destroy(m)),
            AnyChanMsg::Created(m) => Ok(CreateResponse::Created(m)),
            AnyChanMsg::CreatedFast(m) => Ok(CreateResponse::CreatedFast(m)),
            _ => Err(Error::ChanProto(format!(
                "Got a {} in response to circuit creation",
                m.cmd()
            ))),
        }
    }
}

/// A subclass of ChanMsg that can correctly arrive on a live client
/// circuit (one where a CREATED* has been received).
#[derive(Debug)]
pub(crate) enum ClientCircChanMsg {
    /// A relay cell telling us some kind of remote command from some
    /// party on the circuit.
    Relay(chanmsg::Relay),
    /// A cell telling us to destroy the circuit.
    Destroy(chanmsg::Destroy),
    // Note: RELAY_EARLY is not valid to send to clients!
}

impl TryFrom<AnyChanMsg> for ClientCircChanMsg {
    type Error = crate::Error;

    fn try_from(m: AnyChanMsg) -> Result<ClientCircChanMsg> {
        match m {
            AnyChanMsg::Destroy(m) => Ok(ClientCircChanMsg::Destroy(m)),
            AnyChanMsg::Relay(m) => Ok(ClientCircChanMsg::Relay(m)),
            _ => Err(Error::ChanProto(format!(
                "Got a {} cell on an open circuit",
                m.cmd()
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use or_cell::chancell::msg;

    #[test]
    fn create_response() {
        fn good(m: AnyChanMsg) {
            assert!(CreateResponse::try_from(m).is_ok());
        }
        fn bad(m: AnyChanMsg) {
            assert!(CreateResponse::try_from(m).is_err());
        }

        good(msg::Destroy::new(2.into()).into());
        good(msg::Created::new(vec![2; 148]).into());
        good(msg::CreatedFast::new(&b"this offer is unrepeatable"[..]).into());
        bad(msg::CreateFast::new(&b"for a lifetime or more"[..]).into());
        bad(msg::Versions::new([2, 3]).unwrap().into());
    }

    #[test]
    fn client_circ_chan_msg() {
        fn good(m: AnyChanMsg) {
            assert!(ClientCircChanMsg::try_from(m).is_ok());
        }
        fn bad(m: AnyChanMsg) {
            assert!(ClientCircChanMsg::try_from(m).is_err());
        }

        good(msg::Destroy::new(2.into()).into());
        bad(msg::CreatedFast::new(&b"guaranteed in this world"[..]).into());
        good(msg::Relay::new(&b"guaranteed guaranteed"[..]).into());
        bad(msg::Relay::new(&b"for the world and its mother"[..]).into_early());
        bad(msg::Versions::new([2, 3]).unwrap().into());
    }
}
