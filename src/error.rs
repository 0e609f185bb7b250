use std::io;

use derive_more::{Display, Error};

/// Tagged error surface of the filesystem core.
///
/// Every fallible entry point returns one of these kinds; no panic crosses
/// the crate boundary. The host adapters translate their native failures
/// (I/O errors, DOM exceptions, HTTP status codes) into this taxonomy at the
/// boundary.
#[derive(Debug, Display, Error)]
pub enum Error {
    /// Bad argument, missing option, unregistered file, or an operation on a
    /// filesystem that is not configured.
    #[display("{_0}")]
    Invalid(#[error(not(source))] String),

    /// Unknown prepared-statement id or file id.
    #[display("key error: {_0}")]
    KeyError(#[error(not(source))] String),

    /// Host-runtime read/write/open failure, including page write-back.
    #[display("I/O error: {_0}")]
    Io(#[error(not(source))] String),

    /// Non-2xx HTTP response, or missing range support where required.
    #[display("HTTP {code}: {message}")]
    Http {
        code: u16,
        #[error(not(source))]
        message: String,
    },

    /// Engine-reported query or prepare failure.
    #[display("{_0}")]
    Execution(#[error(not(source))] String),

    /// File name collision with an incompatible url.
    #[display("file already registered: {_0}")]
    AlreadyRegistered(#[error(not(source))] String),

    /// Drop attempt on a file that is still held or pinned.
    #[display("file is busy")]
    Busy,

    /// Operation the data protocol cannot provide (e.g. writes to HTTP
    /// sources).
    #[display("not supported: {_0}")]
    NotSupported(#[error(not(source))] String),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub(crate) fn key(msg: impl Into<String>) -> Self {
        Self::KeyError(msg.into())
    }

    pub(crate) fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub(crate) fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

#[cfg(target_family = "wasm")]
impl From<wasm_bindgen::JsValue> for Error {
    fn from(value: wasm_bindgen::JsValue) -> Self {
        use js_sys::{JsString, Object};
        use wasm_bindgen::JsCast;
        use web_sys::DomException;

        match value.dyn_ref::<DomException>() {
            Some(dom) => {
                let name = dom.name();
                let message = dom.message();
                Self::Io(format!("{name}: {message}"))
            }
            None => {
                let js_serialization = Object::from(value).to_string();
                Self::Io(<JsString as ToString>::to_string(&js_serialization))
            }
        }
    }
}

#[cfg(target_family = "wasm")]
impl From<Error> for wasm_bindgen::JsValue {
    fn from(value: Error) -> Self {
        js_sys::Error::new(&value.to_string()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_the_tag() {
        let err = Error::Http {
            code: 416,
            message: "range not satisfiable".into(),
        };
        assert_eq!(err.to_string(), "HTTP 416: range not satisfiable");

        let err = Error::from(io::Error::other("backing store gone"));
        assert!(matches!(err, Error::Io(_)));
    }
}
