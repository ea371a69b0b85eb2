//! Device-protocol code tables.
//!
//! The cloud serves the referential as gzip-compressed JSON, sometimes wrapped
//! in base64 when delivered through the JSON gateway:
//!
//! ```json
//! { "modes": [ { "code": 0, "label": "comfort" }, { "code": 1, "label": "off" } ] }
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

pub const LABEL_OFF: &str = "off";
pub const LABEL_PROGRAM: &str = "program";
pub const LABEL_COMFORT: &str = "comfort";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug)]
pub enum ReferentialError {
    Empty,
    Base64(base64::DecodeError),
    Gzip(std::io::Error),
    Json(serde_path_to_error::Error<serde_json::Error>),
    NoModes,
}

impl fmt::Display for ReferentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferentialError::Empty => write!(f, "empty referential payload"),
            ReferentialError::Base64(e) => write!(f, "referential is neither gzip nor base64: {}", e),
            ReferentialError::Gzip(e) => write!(f, "referential gzip stream: {}", e),
            ReferentialError::Json(e) => write!(f, "referential json at {}: {}", e.path(), e.inner()),
            ReferentialError::NoModes => write!(f, "referential contains no mode codes"),
        }
    }
}

impl std::error::Error for ReferentialError {}

#[derive(Deserialize)]
struct RawReferential {
    modes: Vec<RawEntry>,
}

#[derive(Deserialize)]
struct RawEntry {
    code: i64,
    label: String,
}

/// Mode code ⇄ label lookup. Labels are lower-case snake_case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferentialTable {
    modes: BTreeMap<i64, String>,
}

impl ReferentialTable {
    /// Codes used until the first referential download succeeds.
    pub fn builtin() -> Self {
        Self::from_modes([
            (0, LABEL_COMFORT),
            (1, LABEL_OFF),
            (2, "frost_protection"),
            (3, "eco"),
            (4, "boost"),
            (11, LABEL_PROGRAM),
        ])
    }

    pub fn from_modes<I, S>(modes: I) -> Self
    where
        I: IntoIterator<Item = (i64, S)>,
        S: AsRef<str>,
    {
        ReferentialTable {
            modes: modes
                .into_iter()
                .map(|(code, label)| (code, normalize_label(label.as_ref())))
                .collect(),
        }
    }

    /// Decode a downloaded payload (gzip, base64+gzip or plain JSON).
    pub fn decode(payload: &[u8]) -> Result<Self, ReferentialError> {
        let json = decompress(payload)?;
        let de = &mut serde_json::Deserializer::from_slice(&json);
        let raw: RawReferential = serde_path_to_error::deserialize(de).map_err(ReferentialError::Json)?;
        if raw.modes.is_empty() {
            return Err(ReferentialError::NoModes);
        }
        Ok(Self::from_modes(raw.modes.into_iter().map(|e| (e.code, e.label))))
    }

    pub fn mode_label(&self, code: i64) -> Option<&str> {
        self.modes.get(&code).map(String::as_str)
    }

    pub fn mode_code(&self, label: &str) -> Option<i64> {
        let wanted = normalize_label(label);
        self.modes.iter().find(|(_, l)| **l == wanted).map(|(c, _)| *c)
    }

    /// Labels that act as presets (everything except off and program).
    pub fn presets(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .modes
            .values()
            .map(String::as_str)
            .filter(|l| *l != LABEL_OFF && *l != LABEL_PROGRAM)
            .collect();
        out.dedup();
        out
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }
}

impl Default for ReferentialTable {
    fn default() -> Self {
        Self::builtin()
    }
}

fn normalize_label(label: &str) -> String {
    label
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, ReferentialError> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(ReferentialError::Gzip)?;
    Ok(out)
}

fn decompress(payload: &[u8]) -> Result<Vec<u8>, ReferentialError> {
    let trimmed = payload.trim_ascii();
    if trimmed.is_empty() {
        return Err(ReferentialError::Empty);
    }
    if payload.starts_with(&GZIP_MAGIC) {
        return gunzip(payload);
    }
    if trimmed.starts_with(b"{") {
        return Ok(trimmed.to_vec());
    }
    // JSON gateways deliver the blob as a quoted base64 string.
    let unquoted = trimmed
        .strip_prefix(b"\"")
        .and_then(|s| s.strip_suffix(b"\""))
        .unwrap_or(trimmed);
    let decoded = STANDARD.decode(unquoted).map_err(ReferentialError::Base64)?;
    if decoded.starts_with(&GZIP_MAGIC) {
        gunzip(&decoded)
    } else {
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    const SAMPLE: &str = r#"{"modes":[{"code":0,"label":"Comfort"},{"code":1,"label":"Off"},{"code":3,"label":"Eco"},{"code":8,"label":"Program"},{"code":9,"label":"Frost protection"}]}"#;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn decodes_gzip_payload() {
        let table = ReferentialTable::decode(&gzip(SAMPLE.as_bytes())).unwrap();
        assert_eq!(table.len(), 5);
        assert_eq!(table.mode_label(0), Some("comfort"));
        assert_eq!(table.mode_label(9), Some("frost_protection"));
        assert_eq!(table.mode_code("Program"), Some(8));
        assert_eq!(table.mode_code("turbo"), None);
    }

    #[test]
    fn decodes_base64_wrapped_gzip() {
        let b64 = STANDARD.encode(gzip(SAMPLE.as_bytes()));
        let quoted = format!("\"{}\"\n", b64);
        let table = ReferentialTable::decode(quoted.as_bytes()).unwrap();
        assert_eq!(table.mode_code("eco"), Some(3));
    }

    #[test]
    fn accepts_plain_json() {
        let table = ReferentialTable::decode(SAMPLE.as_bytes()).unwrap();
        assert_eq!(table.presets(), vec!["comfort", "eco", "frost_protection"]);
    }

    #[test]
    fn reports_json_path_on_bad_shape() {
        let bad = gzip(br#"{"modes":[{"code":"zero","label":"x"}]}"#);
        let err = ReferentialTable::decode(&bad).unwrap_err();
        match err {
            ReferentialError::Json(e) => assert_eq!(e.path().to_string(), "modes[0].code"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert!(matches!(ReferentialTable::decode(b"  "), Err(ReferentialError::Empty)));
        assert!(matches!(ReferentialTable::decode(b"%%%"), Err(ReferentialError::Base64(_))));
        assert!(matches!(
            ReferentialTable::decode(br#"{"modes":[]}"#),
            Err(ReferentialError::NoModes)
        ));
    }

    #[test]
    fn builtin_table_covers_command_labels() {
        let t = ReferentialTable::builtin();
        assert!(t.mode_code(LABEL_OFF).is_some());
        assert!(t.mode_code(LABEL_PROGRAM).is_some());
        assert!(t.mode_code(LABEL_COMFORT).is_some());
        assert!(!t.presets().contains(&LABEL_OFF));
    }
}
