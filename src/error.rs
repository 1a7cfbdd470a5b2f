use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::booter::SignError;

/// Why an inbound UDP datagram was discarded.
///
/// Covers both genuinely malformed packets and well-formed packets we
/// have no interest in (non-PXE DHCP traffic, unsupported client
/// architectures). Either way the datagram is dropped with a debug log;
/// a PXE client is never answered with an error.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("packet too short: {actual} bytes, need at least {expected}")]
    TooShort { expected: usize, actual: usize },

    #[error("not a BOOTP request")]
    NotBootRequest,

    #[error("not an Ethernet client")]
    NotEthernet,

    #[error("no DHCP magic cookie")]
    NoMagicCookie,

    #[error("malformed option {tag}")]
    MalformedOption { tag: u8 },

    #[error("not a DHCPDISCOVER")]
    NotDiscover,

    #[error("unsupported client architecture {0}")]
    UnsupportedArch(u16),

    #[error("not a PXE client")]
    NotPxe,

    #[error("no PXE boot item selected")]
    NoBootItem,
}

/// Failure while assembling a DHCP reply.
///
/// These indicate caller bugs (an option value that cannot fit the
/// one-byte length field), so the reply is abandoned rather than sent
/// truncated.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BuildError {
    #[error("option {tag} value too long ({len} bytes)")]
    OptionTooLong { tag: u8, len: usize },

    #[error("boot filename too long ({len} bytes)")]
    BootfileTooLong { len: usize },
}

/// Errors surfaced by the HTTP boot service.
///
/// Whatever went wrong internally, the client only ever sees a status
/// code and a fixed phrase; the full reason goes to the log.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("request {0:?} does not name a MAC address")]
    MissingMac(String),

    #[error(transparent)]
    BadRef(#[from] SignError),

    #[error(transparent)]
    Booter(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::MissingMac(_) => {
                (StatusCode::BAD_REQUEST, "missing MAC address in request\n")
            }
            AppError::BadRef(_) | AppError::Booter(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "couldn't get byte stream\n",
            ),
        };

        tracing::error!("{}: {:#}", status, self);
        (status, message).into_response()
    }
}
