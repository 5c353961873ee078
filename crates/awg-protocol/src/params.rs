//! AmneziaWG obfuscation parameters
//!
//! Sixteen named knobs (Jc/Jmin/Jmax, S1-S4, H1-H4, I1-I5) that add junk
//! packets and header padding on top of plain WireGuard. Values are either
//! integers (as declared in protocol definitions) or raw strings (as read
//! back from a config file).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One obfuscation parameter name
///
/// Variant order is the canonical key order of client links: H1..H4,
/// I1..I5, Jc, Jmax, Jmin, S1..S4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObfuscationParam {
    H1,
    H2,
    H3,
    H4,
    I1,
    I2,
    I3,
    I4,
    I5,
    Jc,
    Jmax,
    Jmin,
    S1,
    S2,
    S3,
    S4,
}

impl ObfuscationParam {
    pub const ALL: [ObfuscationParam; 16] = [
        Self::H1,
        Self::H2,
        Self::H3,
        Self::H4,
        Self::I1,
        Self::I2,
        Self::I3,
        Self::I4,
        Self::I5,
        Self::Jc,
        Self::Jmax,
        Self::Jmin,
        Self::S1,
        Self::S2,
        Self::S3,
        Self::S4,
    ];

    /// Order in which the parameters appear in an `[Interface]` stanza
    pub const INTERFACE_ORDER: [ObfuscationParam; 16] = [
        Self::Jc,
        Self::Jmin,
        Self::Jmax,
        Self::S1,
        Self::S2,
        Self::S3,
        Self::S4,
        Self::H1,
        Self::H2,
        Self::H3,
        Self::H4,
        Self::I1,
        Self::I2,
        Self::I3,
        Self::I4,
        Self::I5,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H1 => "H1",
            Self::H2 => "H2",
            Self::H3 => "H3",
            Self::H4 => "H4",
            Self::I1 => "I1",
            Self::I2 => "I2",
            Self::I3 => "I3",
            Self::I4 => "I4",
            Self::I5 => "I5",
            Self::Jc => "Jc",
            Self::Jmax => "Jmax",
            Self::Jmin => "Jmin",
            Self::S1 => "S1",
            Self::S2 => "S2",
            Self::S3 => "S3",
            Self::S4 => "S4",
        }
    }
}

impl fmt::Display for ObfuscationParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObfuscationParam {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|param| param.as_str() == s)
            .ok_or_else(|| format!("unknown obfuscation parameter '{s}'"))
    }
}

/// Parameter value as declared (integer) or as read from a file (text)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Text(String),
}

impl ParamValue {
    pub fn empty() -> Self {
        ParamValue::Text(String::new())
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

/// A (possibly partial) set of obfuscation parameters, keyed in canonical order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObfuscationParams(BTreeMap<ObfuscationParam, ParamValue>);

impl ObfuscationParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults used when a protocol declaration carries no `awg_junk_params`
    pub fn builtin_defaults() -> Self {
        let mut params = Self::new();
        for (param, value) in [
            (ObfuscationParam::Jc, 4),
            (ObfuscationParam::Jmin, 50),
            (ObfuscationParam::Jmax, 1000),
            (ObfuscationParam::S1, 0),
            (ObfuscationParam::S2, 0),
            (ObfuscationParam::S3, 0),
            (ObfuscationParam::S4, 0),
            (ObfuscationParam::H1, 1),
            (ObfuscationParam::H2, 2),
            (ObfuscationParam::H3, 3),
            (ObfuscationParam::H4, 4),
            (ObfuscationParam::I1, 0),
            (ObfuscationParam::I2, 0),
            (ObfuscationParam::I3, 0),
            (ObfuscationParam::I4, 0),
            (ObfuscationParam::I5, 0),
        ] {
            params.set(param, value);
        }
        params
    }

    pub fn get(&self, param: ObfuscationParam) -> Option<&ParamValue> {
        self.0.get(&param)
    }

    pub fn set(&mut self, param: ObfuscationParam, value: impl Into<ParamValue>) {
        self.0.insert(param, value.into());
    }

    /// All sixteen parameters, missing ones filled with an empty string
    pub fn complete(&self) -> Self {
        let mut full = self.clone();
        for param in ObfuscationParam::ALL {
            full.0.entry(param).or_insert_with(ParamValue::empty);
        }
        full
    }

    /// Rendered value for a config line, empty when unset
    pub fn render(&self, param: ObfuscationParam) -> String {
        self.get(param).map(ToString::to_string).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObfuscationParam, &ParamValue)> {
        self.0.iter().map(|(k, v)| (*k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_order_is_alphabetical() {
        let names: Vec<&str> = ObfuscationParam::ALL.iter().map(|p| p.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "H1", "H2", "H3", "H4", "I1", "I2", "I3", "I4", "I5", "Jc", "Jmax", "Jmin", "S1",
                "S2", "S3", "S4"
            ]
        );
        let mut sorted = ObfuscationParam::INTERFACE_ORDER.to_vec();
        sorted.sort();
        assert_eq!(sorted, ObfuscationParam::ALL.to_vec());
    }

    #[test]
    fn test_params_deserialize_from_yaml_mixed_values() {
        let params: ObfuscationParams =
            serde_yaml::from_str("{ Jc: 4, Jmin: 50, H1: \"1234567\" }").unwrap();
        assert_eq!(params.get(ObfuscationParam::Jc), Some(&ParamValue::Int(4)));
        assert_eq!(
            params.get(ObfuscationParam::H1),
            Some(&ParamValue::Text("1234567".into()))
        );
        assert!(params.get(ObfuscationParam::S1).is_none());
    }

    #[test]
    fn test_unknown_param_rejected() {
        assert!(serde_yaml::from_str::<ObfuscationParams>("{ Jx: 1 }").is_err());
        assert!("Jx".parse::<ObfuscationParam>().is_err());
        assert_eq!("Jmax".parse::<ObfuscationParam>(), Ok(ObfuscationParam::Jmax));
    }

    #[test]
    fn test_complete_fills_missing_with_empty() {
        let mut params = ObfuscationParams::new();
        params.set(ObfuscationParam::Jc, 7);
        let full = params.complete();
        assert_eq!(full.len(), 16);
        assert_eq!(full.render(ObfuscationParam::Jc), "7");
        assert_eq!(full.render(ObfuscationParam::I5), "");
    }

    #[test]
    fn test_json_keys_in_canonical_order() {
        let json = serde_json::to_string(&ObfuscationParams::builtin_defaults()).unwrap();
        let h1 = json.find("\"H1\"").unwrap();
        let jc = json.find("\"Jc\"").unwrap();
        let jmax = json.find("\"Jmax\"").unwrap();
        let jmin = json.find("\"Jmin\"").unwrap();
        let s4 = json.find("\"S4\"").unwrap();
        assert!(h1 < jc && jc < jmax && jmax < jmin && jmin < s4);
    }
}
