//! Fixed-layout payload handed from the injector to the agent.
//!
//! The injector writes the raw bytes of an [`InjectionPayload`] into the
//! target, then starts the agent's start routine with the buffer address as
//! its argument. The agent copies the record before returning, so the buffer
//! can be released as soon as the start routine exits.

use crate::error::{ErrorCode, ErrorRecord};
use std::fmt;

/// UTF-16 units reserved for the archive path, terminator included.
pub const ARTIFACT_PATH_CAPACITY: usize = 260;
/// UTF-16 units reserved for the binary class name, terminator included.
pub const CLASS_NAME_CAPACITY: usize = 256;
/// UTF-16 units reserved for the method name, terminator included.
pub const METHOD_NAME_CAPACITY: usize = 128;

/// Compile-time record size
pub const PAYLOAD_SIZE: usize = std::mem::size_of::<InjectionPayload>();

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("{field} is empty")]
    Empty { field: &'static str },
    #[error("{field} is {len} UTF-16 units, capacity is {max}")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("{field} contains an interior NUL")]
    InteriorNul { field: &'static str },
    #[error("{field} is not NUL-terminated")]
    Unterminated { field: &'static str },
    #[error("hot-reload flag has invalid value {0}")]
    InvalidFlag(u8),
    #[error("payload is {0} bytes, expected {}", PAYLOAD_SIZE)]
    BadLength(usize),
}

impl PayloadError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidParameter
    }
}

impl From<PayloadError> for ErrorRecord {
    #[track_caller]
    fn from(err: PayloadError) -> Self {
        ErrorRecord::new(err.code(), err.to_string())
    }
}

/// Injection payload.
///
/// Layout (1290 bytes, align 2):
/// ```text
/// offset  field           size
/// ------  -------------   ----
///    0    artifact_path    520  (260 x u16, NUL-terminated)
///  520    class_name       512  (256 x u16, NUL-terminated)
/// 1032    method_name      256  (128 x u16, NUL-terminated)
/// 1288    hot_reload         1  (0 or 1)
/// 1289    _reserved          1  (0)
/// ```
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct InjectionPayload {
    artifact_path: [u16; ARTIFACT_PATH_CAPACITY],
    class_name: [u16; CLASS_NAME_CAPACITY],
    method_name: [u16; METHOD_NAME_CAPACITY],
    hot_reload: u8,
    _reserved: u8,
}

// Compile-time assertion: the record must stay exactly 1290 bytes
const _: () = assert!(std::mem::size_of::<InjectionPayload>() == 1290);

impl InjectionPayload {
    /// Build a payload, rejecting any field that does not fit its buffer.
    pub fn new(
        artifact_path: &str,
        class_name: &str,
        method_name: &str,
        hot_reload: bool,
    ) -> Result<Self, PayloadError> {
        Ok(Self {
            artifact_path: encode_field("artifact_path", artifact_path)?,
            class_name: encode_field("class_name", class_name)?,
            method_name: encode_field("method_name", method_name)?,
            hot_reload: u8::from(hot_reload),
            _reserved: 0,
        })
    }

    /// Decode a payload from bytes read out of a transfer buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        if bytes.len() != PAYLOAD_SIZE {
            return Err(PayloadError::BadLength(bytes.len()));
        }
        // SAFETY: length checked above; every bit pattern is a valid
        // InjectionPayload since it only holds integer arrays.
        let payload = unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Self) };
        payload.validate()?;
        Ok(payload)
    }

    /// Copy a payload out of raw memory.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of [`PAYLOAD_SIZE`] bytes.
    pub unsafe fn read_from(ptr: *const u8) -> Result<Self, PayloadError> {
        let bytes = std::slice::from_raw_parts(ptr, PAYLOAD_SIZE);
        Self::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C) with no padding (asserted size equals the sum of
        // the field sizes), so all PAYLOAD_SIZE bytes are initialized.
        unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, PAYLOAD_SIZE) }
    }

    pub fn artifact_path(&self) -> String {
        decode_field(&self.artifact_path)
    }

    pub fn class_name(&self) -> String {
        decode_field(&self.class_name)
    }

    pub fn method_name(&self) -> String {
        decode_field(&self.method_name)
    }

    pub fn hot_reload(&self) -> bool {
        self.hot_reload != 0
    }

    fn validate(&self) -> Result<(), PayloadError> {
        check_terminated("artifact_path", &self.artifact_path)?;
        check_terminated("class_name", &self.class_name)?;
        check_terminated("method_name", &self.method_name)?;
        if self.hot_reload > 1 {
            return Err(PayloadError::InvalidFlag(self.hot_reload));
        }
        Ok(())
    }
}

impl fmt::Debug for InjectionPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectionPayload")
            .field("artifact_path", &self.artifact_path())
            .field("class_name", &self.class_name())
            .field("method_name", &self.method_name())
            .field("hot_reload", &self.hot_reload())
            .finish()
    }
}

fn encode_field<const N: usize>(field: &'static str, value: &str) -> Result<[u16; N], PayloadError> {
    if value.is_empty() {
        return Err(PayloadError::Empty { field });
    }
    if value.contains('\0') {
        return Err(PayloadError::InteriorNul { field });
    }
    let units: Vec<u16> = value.encode_utf16().collect();
    // One unit is reserved for the terminator.
    if units.len() >= N {
        return Err(PayloadError::TooLong {
            field,
            len: units.len(),
            max: N - 1,
        });
    }
    let mut buf = [0u16; N];
    buf[..units.len()].copy_from_slice(&units);
    Ok(buf)
}

fn decode_field(buf: &[u16]) -> String {
    let end = buf.iter().position(|&u| u == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..end])
}

fn check_terminated(field: &'static str, buf: &[u16]) -> Result<(), PayloadError> {
    match buf.iter().position(|&u| u == 0) {
        Some(0) => Err(PayloadError::Empty { field }),
        Some(_) => Ok(()),
        None => Err(PayloadError::Unterminated { field }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InjectionPayload {
        InjectionPayload::new(r"C:\apps\demo.jar", "com.example.Main", "main", true).unwrap()
    }

    #[test]
    fn test_payload_size() {
        assert_eq!(PAYLOAD_SIZE, 1290);
        assert_eq!(sample().as_bytes().len(), PAYLOAD_SIZE);
    }

    #[test]
    fn test_accessors_return_inputs() {
        let p = sample();
        assert_eq!(p.artifact_path(), r"C:\apps\demo.jar");
        assert_eq!(p.class_name(), "com.example.Main");
        assert_eq!(p.method_name(), "main");
        assert!(p.hot_reload());
    }

    #[test]
    fn test_decode_from_transfer_bytes() {
        let p = sample();
        let copy = p.as_bytes().to_vec();
        assert_eq!(InjectionPayload::from_bytes(&copy).unwrap(), p);
    }

    #[test]
    fn test_overlong_field_is_rejected_not_truncated() {
        let long_class = "a".repeat(CLASS_NAME_CAPACITY);
        let err = InjectionPayload::new("/a.jar", &long_class, "main", false).unwrap_err();
        assert_eq!(
            err,
            PayloadError::TooLong {
                field: "class_name",
                len: CLASS_NAME_CAPACITY,
                max: CLASS_NAME_CAPACITY - 1
            }
        );

        let exact = "a".repeat(CLASS_NAME_CAPACITY - 1);
        assert!(InjectionPayload::new("/a.jar", &exact, "main", false).is_ok());
    }

    #[test]
    fn test_capacity_counts_utf16_units() {
        // Each of these code points takes two UTF-16 units.
        let wide = "\u{1F600}".repeat(METHOD_NAME_CAPACITY / 2);
        assert!(matches!(
            InjectionPayload::new("/a.jar", "Main", &wide, false),
            Err(PayloadError::TooLong { field: "method_name", .. })
        ));
    }

    #[test]
    fn test_empty_and_nul_fields_rejected() {
        assert_eq!(
            InjectionPayload::new("", "Main", "main", false).unwrap_err(),
            PayloadError::Empty { field: "artifact_path" }
        );
        assert_eq!(
            InjectionPayload::new("/a.jar", "Ma\0in", "main", false).unwrap_err(),
            PayloadError::InteriorNul { field: "class_name" }
        );
    }

    #[test]
    fn test_unterminated_field_rejected_on_decode() {
        let mut bytes = sample().as_bytes().to_vec();
        // Fill the method name region with non-zero units.
        for b in &mut bytes[1032..1288] {
            *b = 0x41;
        }
        assert_eq!(
            InjectionPayload::from_bytes(&bytes).unwrap_err(),
            PayloadError::Unterminated { field: "method_name" }
        );
    }

    #[test]
    fn test_bad_length_and_flag_rejected() {
        assert_eq!(
            InjectionPayload::from_bytes(&[0u8; 16]).unwrap_err(),
            PayloadError::BadLength(16)
        );
        let mut bytes = sample().as_bytes().to_vec();
        bytes[1288] = 7;
        assert_eq!(
            InjectionPayload::from_bytes(&bytes).unwrap_err(),
            PayloadError::InvalidFlag(7)
        );
    }

    #[test]
    fn test_payload_error_maps_to_invalid_parameter() {
        let record: ErrorRecord = PayloadError::Empty { field: "class_name" }.into();
        assert_eq!(record.code(), ErrorCode::InvalidParameter);
    }
}
