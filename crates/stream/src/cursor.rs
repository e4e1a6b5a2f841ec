//! Opaque message cursors.
//!
//! Raw message ids never leave the server. A cursor is the big-endian id
//! followed by a truncated HMAC-SHA256 tag over it, encoded with base64url
//! (RFC 4648 §5) without padding. Clients can only echo cursors back; a
//! cursor that was altered or minted with another secret fails to unseal.

use std::fmt;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use roost_types::MessageId;
use sha2::Sha256;

/// Length of the id prefix in a decoded cursor
const ID_LENGTH: usize = 8;
/// Length of the truncated tag suffix in a decoded cursor
const TAG_LENGTH: usize = 12;

/// Errors from building a codec or unsealing a cursor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CursorError {
    #[error("Invalid cursor secret")]
    InvalidSecret,

    #[error("Cursor is not valid base64url")]
    Encoding,

    #[error("Cursor has wrong length: {0} bytes")]
    Length(usize),

    #[error("Cursor signature mismatch")]
    Signature,
}

/// Seals message ids into cursors and back.
#[derive(Clone)]
pub struct CursorCodec {
    mac: Hmac<Sha256>,
}

impl fmt::Debug for CursorCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorCodec").finish_non_exhaustive()
    }
}

impl CursorCodec {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, CursorError> {
        let mac = Hmac::<Sha256>::new_from_slice(secret.as_ref())
            .map_err(|_| CursorError::InvalidSecret)?;
        Ok(Self { mac })
    }

    fn tag(&self, id_bytes: &[u8; ID_LENGTH]) -> Hmac<Sha256> {
        let mut mac = self.mac.clone();
        mac.update(id_bytes);
        mac
    }

    /// Encode a message id as an external cursor.
    pub fn seal(&self, id: MessageId) -> String {
        let id_bytes = id.to_be_bytes();
        let tag = self.tag(&id_bytes).finalize().into_bytes();

        let mut raw = Vec::with_capacity(ID_LENGTH + TAG_LENGTH);
        raw.extend_from_slice(&id_bytes);
        raw.extend_from_slice(&tag[..TAG_LENGTH]);
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Decode a cursor previously produced by [`CursorCodec::seal`].
    pub fn unseal(&self, cursor: &str) -> Result<MessageId, CursorError> {
        let raw = URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|_| CursorError::Encoding)?;
        if raw.len() != ID_LENGTH + TAG_LENGTH {
            return Err(CursorError::Length(raw.len()));
        }

        let (id_part, tag_part) = raw.split_at(ID_LENGTH);
        let mut id_bytes = [0u8; ID_LENGTH];
        id_bytes.copy_from_slice(id_part);

        self.tag(&id_bytes)
            .verify_truncated_left(tag_part)
            .map_err(|_| CursorError::Signature)?;
        Ok(MessageId::from_be_bytes(id_bytes))
    }
}
