//! Packed header+body HTTP value
//!
//! HTTP values are the dominant cache payload, so headers and body pack
//! into a single ref-counted [`SharedBuffer`]: byte 0 is a tag (`H` =
//! headers-first, `B` = body-first), bytes 1-4 a u32 LE length of the
//! first region, then the two regions. Either region may arrive first;
//! appending the second never shifts the first, so a value can be built
//! incrementally while older views of the buffer remain valid.

use pagecore_base::SharedBuffer;

use crate::headers::ResponseHeaders;
use crate::{Error, Result};

const TAG_HEADERS_FIRST: u8 = b'H';
const TAG_BODY_FIRST: u8 = b'B';
const PREAMBLE: usize = 5;

/// An HTTP response (headers + body) packed into one shared buffer.
#[derive(Clone, Debug, Default)]
pub struct HttpValue {
    buf: SharedBuffer,
    headers_set: bool,
}

impl HttpValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install serialized headers. If the buffer is empty they become
    /// the first region; if a body-first buffer exists they are
    /// appended as the second region. Setting headers twice is an
    /// error.
    pub fn set_headers(&mut self, headers: &ResponseHeaders) -> Result<()> {
        if self.headers_set {
            return Err(Error::HeadersAlreadySet);
        }
        let encoded = headers.encode();
        if self.buf.is_empty() {
            if encoded.len() > u32::MAX as usize {
                return Err(Error::RegionTooLarge);
            }
            self.buf.append(&[TAG_HEADERS_FIRST]);
            self.buf.append(&(encoded.len() as u32).to_le_bytes());
            self.buf.append(&encoded);
        } else {
            // Body-first layout: headers go behind the body and the
            // prefix (body length) is untouched.
            self.buf.append(&encoded);
        }
        self.headers_set = true;
        Ok(())
    }

    /// Append body bytes. The first write of a body-first value lays
    /// down the tag and length prefix; later writes keep the prefix in
    /// sync with the body size.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buf.is_empty() {
            if bytes.len() > u32::MAX as usize {
                return Err(Error::RegionTooLarge);
            }
            self.buf.append(&[TAG_BODY_FIRST]);
            self.buf.append(&(bytes.len() as u32).to_le_bytes());
            self.buf.append(bytes);
            return Ok(());
        }

        match self.buf.as_slice()[0] {
            TAG_HEADERS_FIRST => {
                // Body is the second region; no prefix to maintain.
                self.buf.append(bytes);
                Ok(())
            }
            TAG_BODY_FIRST => {
                if self.headers_set {
                    // Headers already landed behind the body; growing
                    // the first region would shift them.
                    return Err(Error::MalformedValue(
                        "body write after headers appended".into(),
                    ));
                }
                let old_len = self.first_region_len()? as usize;
                let new_len = old_len
                    .checked_add(bytes.len())
                    .filter(|&l| l <= u32::MAX as usize)
                    .ok_or(Error::RegionTooLarge)?;
                self.buf.append(bytes);
                self.buf.write_at(1, &(new_len as u32).to_le_bytes())?;
                Ok(())
            }
            tag => Err(Error::MalformedValue(format!("unknown tag {tag:#x}"))),
        }
    }

    fn first_region_len(&self) -> Result<u32> {
        let slice = self.buf.as_slice();
        if slice.len() < PREAMBLE {
            return Err(Error::MalformedValue("shorter than preamble".into()));
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&slice[1..PREAMBLE]);
        Ok(u32::from_le_bytes(raw))
    }

    /// True iff the buffer is structurally sound: total size at least
    /// the preamble and the prefix not pointing past the end.
    pub fn is_extractable(&self) -> bool {
        match self.first_region_len() {
            Ok(len) => len as usize <= self.buf.len() - PREAMBLE,
            Err(_) => false,
        }
    }

    fn regions(&self) -> Result<(SharedBuffer, SharedBuffer)> {
        let first_len = self.first_region_len()? as usize;
        let total = self.buf.len();
        if first_len > total - PREAMBLE {
            return Err(Error::MalformedValue(format!(
                "prefix {first_len} exceeds payload {}",
                total - PREAMBLE
            )));
        }
        let mut first = self.buf.clone();
        first.remove_prefix(PREAMBLE);
        first.remove_suffix(total - PREAMBLE - first_len);
        let mut second = self.buf.clone();
        second.remove_prefix(PREAMBLE + first_len);
        Ok((first, second))
    }

    /// Decode the header region. Fails on malformed buffers; never
    /// panics.
    pub fn extract_headers(&self) -> Result<ResponseHeaders> {
        let (first, second) = self.regions()?;
        let header_bytes = match self.buf.as_slice()[0] {
            TAG_HEADERS_FIRST => first,
            TAG_BODY_FIRST => second,
            tag => return Err(Error::MalformedValue(format!("unknown tag {tag:#x}"))),
        };
        ResponseHeaders::decode(header_bytes.as_slice())
    }

    /// Return the body region as a cheap view over the shared storage.
    pub fn extract_contents(&self) -> Result<SharedBuffer> {
        let (first, second) = self.regions()?;
        match self.buf.as_slice()[0] {
            TAG_HEADERS_FIRST => Ok(second),
            TAG_BODY_FIRST => Ok(first),
            tag => Err(Error::MalformedValue(format!("unknown tag {tag:#x}"))),
        }
    }

    /// Adopt a buffer from an untrusted source (a cache hit). The
    /// buffer is validated by a full header extraction; on failure the
    /// value is left unchanged and `false` is returned.
    pub fn link(&mut self, src: &SharedBuffer) -> bool {
        let candidate = HttpValue {
            buf: src.clone(),
            headers_set: true,
        };
        if candidate.extract_headers().is_err() {
            return false;
        }
        *self = candidate;
        true
    }

    /// Hand out the underlying shared buffer (for a cache put).
    pub fn share(&self) -> SharedBuffer {
        self.buf.clone()
    }

    /// Total packed size in bytes.
    pub fn size(&self) -> usize {
        self.buf.len()
    }
}
