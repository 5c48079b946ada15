//! HTTP response headers: storage, binary codec, caching analysis
//!
//! Headers serialize to a deterministic binary form so that HTTP values
//! hash and compare stably across cache layers: three length-prefixed
//! UTF-8 strings (version, status code, reason) followed by a
//! count-prefixed list of (name, value) pairs, all prefixes u32 LE.

use tracing::trace;

use crate::{Error, Result};

/// Freshness lifetime applied to 2xx responses that carry no explicit
/// freshness information.
pub const DEFAULT_IMPLICIT_CACHE_TTL_MS: i64 = 5 * 60 * 1000;

/// Parsed HTTP response headers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseHeaders {
    pub major_version: u32,
    pub minor_version: u32,
    pub status_code: u16,
    pub reason_phrase: String,
    pairs: Vec<(String, String)>,
}

impl ResponseHeaders {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            major_version: 1,
            minor_version: 1,
            status_code,
            reason_phrase: reason_phrase.into(),
            pairs: Vec::new(),
        }
    }

    /// Append a header, keeping any existing values for the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((name.into(), value.into()));
    }

    /// Replace every value of `name` with a single value.
    pub fn replace(&mut self, name: &str, value: impl Into<String>) {
        self.remove_all(name);
        self.pairs.push((name.to_string(), value.into()));
    }

    /// Remove every value of `name`.
    pub fn remove_all(&mut self, name: &str) {
        self.pairs.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// All values of `name`, in insertion order.
    pub fn lookup(&self, name: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// First value of `name`, if any.
    pub fn lookup_first(&self, name: &str) -> Option<&str> {
        self.lookup(name).first().copied()
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Serialize to the deterministic binary form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        write_str(
            &mut out,
            &format!("HTTP/{}.{}", self.major_version, self.minor_version),
        );
        write_str(&mut out, &self.status_code.to_string());
        write_str(&mut out, &self.reason_phrase);
        out.extend_from_slice(&(self.pairs.len() as u32).to_le_bytes());
        for (name, value) in &self.pairs {
            write_str(&mut out, name);
            write_str(&mut out, value);
        }
        out
    }

    /// Decode the binary form. Malformed input is an error, never a
    /// panic.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = 0usize;
        let version = read_str(bytes, &mut cursor)?;
        let status = read_str(bytes, &mut cursor)?;
        let reason = read_str(bytes, &mut cursor)?;

        let rest = version
            .strip_prefix("HTTP/")
            .ok_or_else(|| Error::MalformedValue(format!("bad version: {version}")))?;
        let (major, minor) = rest
            .split_once('.')
            .and_then(|(a, b)| Some((a.parse().ok()?, b.parse().ok()?)))
            .ok_or_else(|| Error::MalformedValue(format!("bad version: {version}")))?;
        let status_code: u16 = status
            .parse()
            .map_err(|_| Error::MalformedValue(format!("bad status: {status}")))?;

        let count = read_u32(bytes, &mut cursor)? as usize;
        // Cap the preallocation; a corrupt count must not allocate 4 GiB.
        let mut pairs = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let name = read_str(bytes, &mut cursor)?;
            let value = read_str(bytes, &mut cursor)?;
            pairs.push((name, value));
        }

        Ok(Self {
            major_version: major,
            minor_version: minor,
            status_code,
            reason_phrase: reason,
            pairs,
        })
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    let end = cursor
        .checked_add(4)
        .filter(|&e| e <= bytes.len())
        .ok_or_else(|| Error::MalformedValue("truncated length prefix".into()))?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[*cursor..end]);
    *cursor = end;
    Ok(u32::from_le_bytes(raw))
}

fn read_str(bytes: &[u8], cursor: &mut usize) -> Result<String> {
    let len = read_u32(bytes, cursor)? as usize;
    let end = cursor
        .checked_add(len)
        .filter(|&e| e <= bytes.len())
        .ok_or_else(|| Error::MalformedValue("truncated string".into()))?;
    let s = std::str::from_utf8(&bytes[*cursor..end])
        .map_err(|_| Error::MalformedValue("non-UTF-8 string".into()))?
        .to_string();
    *cursor = end;
    Ok(s)
}

/// Caching verdict computed from response headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachePolicy {
    pub cacheable: bool,
    /// Absolute expiration, wall-clock microseconds since epoch. Only
    /// meaningful when `cacheable`.
    pub expiration_us: i64,
}

impl CachePolicy {
    pub fn uncacheable() -> Self {
        Self {
            cacheable: false,
            expiration_us: 0,
        }
    }

    /// Derive the policy from `Cache-Control`, `Expires`, and `Date`.
    ///
    /// `private`, `no-store`, `no-cache`, and `max-age<=0` are
    /// uncacheable. A non-2xx response with no explicit freshness is
    /// uncacheable; a 2xx without explicit freshness gets
    /// `implicit_ttl_ms` from now.
    pub fn from_headers(headers: &ResponseHeaders, now_us: i64, implicit_ttl_ms: i64) -> Self {
        let mut max_age_s: Option<i64> = None;
        for value in headers.lookup("Cache-Control") {
            for directive in value.split(',') {
                let directive = directive.trim().to_ascii_lowercase();
                match directive.as_str() {
                    "private" | "no-store" | "no-cache" => {
                        trace!("Uncacheable: Cache-Control {directive}");
                        return Self::uncacheable();
                    }
                    _ => {
                        if let Some(age) = directive.strip_prefix("max-age=") {
                            max_age_s = age.trim().parse().ok();
                        }
                    }
                }
            }
        }

        if let Some(age) = max_age_s {
            if age <= 0 {
                return Self::uncacheable();
            }
            let base = headers
                .lookup_first("Date")
                .and_then(parse_http_date_us)
                .unwrap_or(now_us);
            return Self {
                cacheable: true,
                expiration_us: base + age * 1_000_000,
            };
        }

        if let Some(expires) = headers.lookup_first("Expires").and_then(parse_http_date_us) {
            if expires <= now_us {
                return Self::uncacheable();
            }
            return Self {
                cacheable: true,
                expiration_us: expires,
            };
        }

        // No explicit freshness at all.
        let is_2xx = (200..300).contains(&headers.status_code);
        if !is_2xx {
            return Self::uncacheable();
        }
        Self {
            cacheable: true,
            expiration_us: now_us + implicit_ttl_ms * 1000,
        }
    }

    /// True when the entry is still fresh at `now_us`.
    pub fn is_fresh(&self, now_us: i64) -> bool {
        self.cacheable && now_us < self.expiration_us
    }
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Parse an RFC 1123 HTTP date (`Sun, 06 Nov 1994 08:49:37 GMT`) into
/// microseconds since the Unix epoch. Returns `None` on any deviation.
pub fn parse_http_date_us(s: &str) -> Option<i64> {
    // Strip the weekday; it is redundant with the date.
    let rest = s.split_once(',').map(|(_, r)| r).unwrap_or(s).trim();
    let mut parts = rest.split_ascii_whitespace();
    let day: i64 = parts.next()?.parse().ok()?;
    let month = parts.next()?;
    let month: i64 = MONTHS.iter().position(|m| m.eq_ignore_ascii_case(month))? as i64 + 1;
    let year: i64 = parts.next()?.parse().ok()?;
    let mut hms = parts.next()?.split(':');
    let hour: i64 = hms.next()?.parse().ok()?;
    let minute: i64 = hms.next()?.parse().ok()?;
    let second: i64 = hms.next()?.parse().ok()?;
    if parts.next() != Some("GMT") {
        return None;
    }
    if !(1..=31).contains(&day) || hour > 23 || minute > 59 || second > 60 {
        return None;
    }
    Some(days_from_civil(year, month, day) * 86_400_000_000 + (hour * 3600 + minute * 60 + second) * 1_000_000)
}

/// Format microseconds since epoch as an RFC 1123 HTTP date.
pub fn format_http_date_us(us: i64) -> String {
    let secs = us.div_euclid(1_000_000);
    let days = secs.div_euclid(86_400);
    let tod = secs.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    let weekday = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"][days.rem_euclid(7) as usize];
    format!(
        "{weekday}, {day:02} {} {year} {:02}:{:02}:{:02} GMT",
        MONTHS[(month - 1) as usize],
        tod / 3600,
        (tod % 3600) / 60,
        tod % 60
    )
}

// Howard Hinnant's civil calendar conversions.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}
