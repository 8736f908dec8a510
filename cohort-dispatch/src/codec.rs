use rkyv::de::deserializers::SharedDeserializeMap;
use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, CheckBytes, Deserialize, Serialize};

use crate::error::CodecError;
use crate::SCRATCH_SPACE;

/// Converts values of type `T` to and from bytes.
///
/// Every logical service brings its own marshaller so that services
/// sharing one transport may use incompatible wire schemas.
pub trait Marshal<T>: Send + Sync + 'static {
    fn marshal(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn unmarshal(&self, buf: &[u8]) -> Result<T, CodecError>;
}

#[derive(Debug, Copy, Clone, Default)]
/// The default marshaller, encoding values with rkyv.
///
/// Incoming buffers are validated before being deserialized.
pub struct RkyvMarshaller;

impl<T> Marshal<T> for RkyvMarshaller
where
    T: Archive + Serialize<AllocSerializer<SCRATCH_SPACE>>,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>>
        + Deserialize<T, SharedDeserializeMap>,
{
    fn marshal(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        rkyv::to_bytes::<_, SCRATCH_SPACE>(value)
            .map(|buf| buf.to_vec())
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn unmarshal(&self, buf: &[u8]) -> Result<T, CodecError> {
        // Frames are sliced out of larger buffers so the data is rarely aligned.
        let mut aligned = AlignedVec::with_capacity(buf.len());
        aligned.extend_from_slice(buf);

        rkyv::from_bytes::<T>(&aligned).map_err(|_| {
            CodecError::Decode(format!(
                "buffer is not a valid archived {}",
                std::any::type_name::<T>()
            ))
        })
    }
}
