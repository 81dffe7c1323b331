//! Machine configuration — a typed wrapper over a merged JSON document.
//!
//! Option sources are merged over the defaults one `set_options` call at a
//! time, so partial documents only touch the keys they mention. Unknown keys
//! are ignored (and reported once per call via [`Error::UnknownOption`]) so a
//! newer configuration file keeps working against an older engine.

use serde_json::Value;

use crate::error::Error;

/// `(key, type-checker)` for every recognised option.
const KNOWN_OPTIONS: [(&str, fn(&Value) -> bool); 7] = [
    ("clockSamplingFreq", Value::is_number),
    ("isrFreq", Value::is_number),
    ("runAsync", Value::is_boolean),
    ("saveAsync", Value::is_boolean),
    ("loadAsync", Value::is_boolean),
    ("encoder", Value::is_string),
    ("compressor", Value::is_string),
];

const DEFAULT_OPTIONS: &str = r#"{"clockSamplingFreq":-1,"compressor":"zlib","encoder":"base64","loadAsync":false,"saveAsync":false,"isrFreq":0,"runAsync":false}"#;

pub(crate) struct Options {
    json: Value,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            json: serde_json::from_str(DEFAULT_OPTIONS).unwrap(),
        }
    }
}

impl Options {
    /// Merge a new option document over the current one.
    ///
    /// Accepts `file://<path>` (JSON read from disk), `json://<literal>`, or
    /// a raw JSON string. `None` restores the defaults.
    pub fn set_options(&mut self, opts: Option<&str>) -> Result<(), Error> {
        let opts = match opts {
            Some(o) => o,
            None => {
                self.json = serde_json::from_str(DEFAULT_OPTIONS).unwrap();
                return Ok(());
            }
        };

        let text = if let Some(path) = opts.strip_prefix("file://") {
            std::fs::read_to_string(path).map_err(|e| Error::JsonParse(format!("{path}: {e}")))?
        } else if let Some(literal) = opts.strip_prefix("json://") {
            literal.to_string()
        } else {
            opts.to_string()
        };

        let incoming: Value =
            serde_json::from_str(&text).map_err(|e| Error::JsonParse(e.to_string()))?;

        let map = match incoming {
            Value::Object(map) => map,
            _ => return Err(Error::JsonParse("expected a json object".into())),
        };

        if let Some(freq) = map.get("isrFreq").and_then(Value::as_f64) {
            if freq < 0.0 {
                return Err(Error::JsonConfig("isrFreq must be >= 0".into()));
            }
        }

        match map.get("encoder").and_then(Value::as_str) {
            None | Some("base64") | Some("none") => {}
            Some(other) => return Err(Error::Encoder(other.into())),
        }

        match map.get("compressor").and_then(Value::as_str) {
            None | Some("zlib") | Some("none") => {}
            Some(other) => return Err(Error::Compressor(other.into())),
        }

        let mut unknown = Vec::new();

        for (key, value) in map {
            match KNOWN_OPTIONS.iter().find(|(name, _)| *name == key) {
                Some((_, type_ok)) => {
                    if !type_ok(&value) {
                        return Err(Error::JsonConfig(format!("bad type for option {key}")));
                    }

                    self.json[key.as_str()] = value;
                }
                None => unknown.push(key),
            }
        }

        if unknown.is_empty() {
            Ok(())
        } else {
            let unknown = unknown.join(", ");
            log::warn!("ignoring unknown options: {unknown}");
            Err(Error::UnknownOption(unknown))
        }
    }

    pub fn clock_sampling_freq(&self) -> f64 {
        self.json["clockSamplingFreq"].as_f64().unwrap_or(-1.0)
    }

    pub fn isr_freq(&self) -> f64 {
        self.json["isrFreq"].as_f64().unwrap_or(0.0)
    }

    pub fn run_async(&self) -> bool {
        self.json["runAsync"].as_bool().unwrap_or(false)
    }

    pub fn save_async(&self) -> bool {
        self.json["saveAsync"].as_bool().unwrap_or(false)
    }

    pub fn load_async(&self) -> bool {
        self.json["loadAsync"].as_bool().unwrap_or(false)
    }

    pub fn encoder(&self) -> String {
        self.json["encoder"].as_str().unwrap_or("base64").to_string()
    }

    pub fn compressor(&self) -> String {
        self.json["compressor"].as_str().unwrap_or("zlib").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = Options::default();
        assert_eq!(opts.clock_sampling_freq(), -1.0);
        assert_eq!(opts.isr_freq(), 0.0);
        assert!(!opts.run_async());
        assert!(!opts.save_async());
        assert!(!opts.load_async());
        assert_eq!(opts.encoder(), "base64");
        assert_eq!(opts.compressor(), "zlib");
    }

    #[test]
    fn merge_is_partial() {
        let mut opts = Options::default();
        opts.set_options(Some(r#"json://{"isrFreq":60,"runAsync":true}"#))
            .unwrap();
        assert_eq!(opts.isr_freq(), 60.0);
        assert!(opts.run_async());
        // Untouched keys keep their previous values.
        assert_eq!(opts.compressor(), "zlib");

        opts.set_options(None).unwrap();
        assert_eq!(opts.isr_freq(), 0.0);
        assert!(!opts.run_async());
    }

    #[test]
    fn raw_json_is_accepted() {
        let mut opts = Options::default();
        opts.set_options(Some(r#"{"clockSamplingFreq":40}"#)).unwrap();
        assert_eq!(opts.clock_sampling_freq(), 40.0);
    }

    #[test]
    fn file_source() {
        let path = std::env::temp_dir().join("meen_opts_test.json");
        std::fs::write(&path, r#"{"isrFreq":30}"#).unwrap();

        let mut opts = Options::default();
        opts.set_options(Some(&format!("file://{}", path.display())))
            .unwrap();
        assert_eq!(opts.isr_freq(), 30.0);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_a_parse_error() {
        let mut opts = Options::default();
        assert!(matches!(
            opts.set_options(Some("file:///no/such/meen_options.json")),
            Err(Error::JsonParse(_))
        ));
    }

    #[test]
    fn negative_isr_freq_is_rejected() {
        let mut opts = Options::default();
        assert_eq!(
            opts.set_options(Some(r#"json://{"isrFreq":-1.0}"#)),
            Err(Error::JsonConfig("isrFreq must be >= 0".into()))
        );
        assert_eq!(opts.isr_freq(), 0.0);
    }

    #[test]
    fn malformed_json_is_rejected() {
        let mut opts = Options::default();
        assert!(matches!(
            opts.set_options(Some(r#"json://{"isrFreq":"#)),
            Err(Error::JsonParse(_))
        ));
    }

    #[test]
    fn unknown_codecs_are_rejected() {
        let mut opts = Options::default();
        assert_eq!(
            opts.set_options(Some(r#"json://{"compressor":"lz4"}"#)),
            Err(Error::Compressor("lz4".into()))
        );
        assert_eq!(
            opts.set_options(Some(r#"json://{"encoder":"rot13"}"#)),
            Err(Error::Encoder("rot13".into()))
        );
    }

    #[test]
    fn unknown_keys_warn_but_apply_the_rest() {
        let mut opts = Options::default();
        assert_eq!(
            opts.set_options(Some(r#"json://{"isrFreq":10,"warpFactor":9}"#)),
            Err(Error::UnknownOption("warpFactor".into()))
        );
        // The recognised key was still applied.
        assert_eq!(opts.isr_freq(), 10.0);
    }
}
