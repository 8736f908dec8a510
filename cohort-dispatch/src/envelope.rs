use std::fmt::{Debug, Display, Formatter};
use std::mem;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::command::CommandKey;
use crate::error::CodecError;

const CLIENT_ID_LEN_SIZE: usize = mem::size_of::<u16>();
const COMMAND_KEY_SIZE: usize = mem::size_of::<u32>();

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// The opaque identifier of a logical service sharing a transport.
pub struct ClientId(Bytes);

impl ClientId {
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&'static str> for ClientId {
    fn from(id: &'static str) -> Self {
        Self(Bytes::from_static(id.as_bytes()))
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(Bytes::from(id))
    }
}

impl From<Vec<u8>> for ClientId {
    fn from(id: Vec<u8>) -> Self {
        Self(Bytes::from(id))
    }
}

impl From<Bytes> for ClientId {
    fn from(id: Bytes) -> Self {
        Self(id)
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl Debug for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientId({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Builds the body of a request frame.
///
/// The layout is `[client id len u16][client id][command key u32][command]`.
pub(crate) fn encode_request(
    client_id: &ClientId,
    key: CommandKey,
    command: &[u8],
) -> Result<Bytes, CodecError> {
    let id = client_id.as_bytes();
    let id_len = u16::try_from(id.len()).map_err(|_| {
        CodecError::Encode(format!(
            "client id is {} bytes long, the limit is {}",
            id.len(),
            u16::MAX
        ))
    })?;

    let mut buffer = BytesMut::with_capacity(
        CLIENT_ID_LEN_SIZE + id.len() + COMMAND_KEY_SIZE + command.len(),
    );
    buffer.put_u16_le(id_len);
    buffer.put_slice(id);
    buffer.put_u32_le(key.0);
    buffer.put_slice(command);
    Ok(buffer.freeze())
}

/// Reads the client id from a request body, returning the remaining bytes.
///
/// The command itself is left untouched so that nothing is decoded
/// before the receiver knows a registration exists.
pub(crate) fn read_client_id(body: &Bytes) -> Result<(ClientId, Bytes), CodecError> {
    if body.len() < CLIENT_ID_LEN_SIZE {
        return Err(CodecError::Decode("request body is missing the client id".into()));
    }

    let mut buf = body.clone();
    let id_len = buf.get_u16_le() as usize;
    if buf.len() < id_len {
        return Err(CodecError::Decode(format!(
            "client id is declared as {} bytes but only {} remain",
            id_len,
            buf.len()
        )));
    }

    let id = buf.split_to(id_len);
    Ok((ClientId(id), buf))
}

/// Reads the command key from the remainder of a request body.
pub(crate) fn read_command(rest: &Bytes) -> Result<(CommandKey, Bytes), CodecError> {
    if rest.len() < COMMAND_KEY_SIZE {
        return Err(CodecError::Decode("request body is missing the command key".into()));
    }

    let mut buf = rest.clone();
    let key = CommandKey(buf.get_u32_le());
    Ok((key, buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_is_read_in_stages() {
        let client_id = ClientId::from("inventory");
        let body = encode_request(&client_id, CommandKey(77), b"command-bytes").unwrap();

        let (decoded_id, rest) = read_client_id(&body).expect("Read client id");
        assert_eq!(decoded_id, client_id);

        let (key, command) = read_command(&rest).expect("Read command");
        assert_eq!(key, CommandKey(77));
        assert_eq!(command.as_ref(), b"command-bytes");
    }

    #[test]
    fn test_malformed_envelopes() {
        assert!(read_client_id(&Bytes::from_static(&[1])).is_err());
        assert!(read_client_id(&Bytes::from_static(&[10, 0, b'a'])).is_err());

        let (_, rest) = read_client_id(&Bytes::from_static(&[1, 0, b'a', 1])).unwrap();
        assert!(read_command(&rest).is_err());
    }

    #[test]
    fn test_client_id_display() {
        let id = ClientId::from(String::from("sessions"));
        assert_eq!(id.to_string(), "sessions");
        assert_eq!(format!("{:?}", id), "ClientId(\"sessions\")");

        let raw = ClientId::from(vec![0xFF, b'a']);
        assert_eq!(raw.as_bytes(), &[0xFF, b'a']);
    }
}
