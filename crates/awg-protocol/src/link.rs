//! Typed documents carried inside `vpn://` links
//!
//! Field order mirrors the JSON the AmneziaVPN client expects: obfuscation
//! parameters first, in canonical order, then the remaining fields.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::codec;
use crate::error::Result;
use crate::params::{ObfuscationParam, ObfuscationParams, ParamValue};

/// Transport name for AmneziaWG containers
pub const TRANSPORT_UDP: &str = "udp";

/// Protocol version marker of AmneziaWG 2 containers
pub const PROTOCOL_VERSION: &str = "2";

/// Top-level link document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnLink {
    pub containers: Vec<ContainerEntry>,
    #[serde(rename = "defaultContainer")]
    pub default_container: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub dns1: String,
    pub dns2: String,
    #[serde(rename = "hostName")]
    pub host_name: String,
}

/// One container of the link (`{"awg": {...}, "container": "..."}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEntry {
    pub awg: AwgBlock,
    pub container: String,
}

/// Per-container AmneziaWG settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwgBlock {
    #[serde(flatten, deserialize_with = "known_params")]
    pub params: ObfuscationParams,
    /// [`LastConfig`] as an indented JSON string
    pub last_config: String,
    pub port: String,
    pub protocol_version: String,
    pub subnet_address: String,
    pub transport_proto: String,
    /// Keys this crate does not model, kept as received
    #[serde(flatten, deserialize_with = "unknown_keys")]
    pub extra: BTreeMap<String, Value>,
}

impl AwgBlock {
    /// Parse the embedded client config
    pub fn parse_last_config(&self) -> Result<LastConfig> {
        Ok(serde_json::from_str(&self.last_config)?)
    }
}

/// Per-client settings embedded in [`AwgBlock::last_config`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastConfig {
    #[serde(flatten, deserialize_with = "known_params")]
    pub params: ObfuscationParams,
    pub allowed_ips: Vec<String>,
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub client_ip: String,
    pub client_priv_key: String,
    pub client_pub_key: String,
    /// Rendered client profile with `$PRIMARY_DNS`/`$SECONDARY_DNS` placeholders
    pub config: String,
    #[serde(rename = "hostName")]
    pub host_name: String,
    pub mtu: String,
    pub persistent_keep_alive: String,
    pub port: u16,
    pub psk_key: String,
    pub server_pub_key: String,
    #[serde(flatten, deserialize_with = "unknown_keys")]
    pub extra: BTreeMap<String, Value>,
}

impl LastConfig {
    /// Canonical JSON text for embedding into an [`AwgBlock`]
    pub fn to_embedded_json(&self) -> Result<String> {
        codec::to_canonical_json(self)
    }
}

impl VpnLink {
    pub fn encode(&self) -> Result<String> {
        codec::encode(self)
    }

    pub fn decode(uri: &str) -> Result<Self> {
        codec::decode(uri)
    }

    /// Container entry named by `defaultContainer`
    pub fn default_entry(&self) -> Option<&ContainerEntry> {
        self.containers
            .iter()
            .find(|entry| entry.container == self.default_container)
    }
}

/// Obfuscation parameters among the flattened keys of a block
fn known_params<'de, D>(deserializer: D) -> std::result::Result<ObfuscationParams, D::Error>
where
    D: Deserializer<'de>,
{
    let mut params = ObfuscationParams::new();
    for (key, value) in BTreeMap::<String, Value>::deserialize(deserializer)? {
        if let Ok(param) = key.parse::<ObfuscationParam>() {
            let value = ParamValue::deserialize(value).map_err(serde::de::Error::custom)?;
            params.set(param, value);
        }
    }
    Ok(params)
}

/// Flattened keys of a block that are not obfuscation parameters
fn unknown_keys<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut keys = BTreeMap::<String, Value>::deserialize(deserializer)?;
    keys.retain(|key, _| key.parse::<ObfuscationParam>().is_err());
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ObfuscationParam, ParamValue};

    fn last_config() -> LastConfig {
        LastConfig {
            params: ObfuscationParams::builtin_defaults(),
            allowed_ips: vec!["0.0.0.0/0".into(), "::/0".into()],
            client_id: "cHVi".into(),
            client_ip: "10.8.1.2".into(),
            client_priv_key: "cHJpdg==".into(),
            client_pub_key: "cHVi".into(),
            config: "[Interface]\n".into(),
            host_name: "vpn.example.com".into(),
            mtu: "1376".into(),
            persistent_keep_alive: "25".into(),
            port: 51820,
            psk_key: "cHNr".into(),
            server_pub_key: "c3J2".into(),
            extra: BTreeMap::new(),
        }
    }

    fn link() -> VpnLink {
        VpnLink {
            containers: vec![ContainerEntry {
                awg: AwgBlock {
                    params: ObfuscationParams::builtin_defaults(),
                    last_config: last_config().to_embedded_json().unwrap(),
                    port: "51820".into(),
                    protocol_version: PROTOCOL_VERSION.into(),
                    subnet_address: "10.8.1.0".into(),
                    transport_proto: TRANSPORT_UDP.into(),
                    extra: BTreeMap::new(),
                },
                container: "amnezia-awg2".into(),
            }],
            default_container: "amnezia-awg2".into(),
            description: String::new(),
            dns1: "1.1.1.1".into(),
            dns2: "1.0.0.1".into(),
            host_name: "vpn.example.com".into(),
        }
    }

    #[test]
    fn test_link_roundtrip() {
        let original = link();
        let decoded = VpnLink::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(
            decoded.default_entry().unwrap().awg.parse_last_config().unwrap(),
            last_config()
        );
    }

    #[test]
    fn test_field_order_and_names() {
        let json = codec::to_canonical_json(&link()).unwrap();
        let order = ["\"containers\"", "\"defaultContainer\"", "\"dns1\"", "\"dns2\"", "\"hostName\""];
        let positions: Vec<usize> = order.iter().map(|k| json.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(!json.contains("\"description\""));

        let awg = json.find("\"awg\"").unwrap();
        let h1 = json[awg..].find("\"H1\"").unwrap();
        let s4 = json[awg..].find("\"S4\"").unwrap();
        let last = json[awg..].find("\"last_config\"").unwrap();
        let transport = json[awg..].find("\"transport_proto\"").unwrap();
        assert!(h1 < s4 && s4 < last && last < transport);
    }

    #[test]
    fn test_description_included_when_set() {
        let mut with_description = link();
        with_description.description = "AmneziaWG Server".into();
        let json = codec::to_canonical_json(&with_description).unwrap();
        let desc = json.find("\"description\"").unwrap();
        assert!(json.find("\"defaultContainer\"").unwrap() < desc);
        assert!(desc < json.find("\"dns1\"").unwrap());
    }

    #[test]
    fn test_last_config_embedded_as_indented_json() {
        let embedded = last_config().to_embedded_json().unwrap();
        assert!(embedded.starts_with("{\n    \"H1\": 1,"));
        assert!(embedded.contains("\n    \"port\": 51820,"));
        assert!(embedded.contains("\n    \"persistent_keep_alive\": \"25\","));
    }

    #[test]
    fn test_text_params_survive_roundtrip() {
        let mut decoded = link();
        decoded.containers[0]
            .awg
            .params
            .set(ObfuscationParam::Jc, ParamValue::Text("5".into()));
        let again = VpnLink::decode(&decoded.encode().unwrap()).unwrap();
        assert_eq!(
            again.containers[0].awg.params.get(ObfuscationParam::Jc),
            Some(&ParamValue::Text("5".into()))
        );
    }

    #[test]
    fn test_unknown_keys_are_kept() {
        let mut value = serde_json::to_value(link()).unwrap();
        let awg = &mut value["containers"][0]["awg"];
        awg["mtu"] = Value::from("1280");
        awg["isThirdPartyConfig"] = Value::from(true);
        let mut last: Value = serde_json::from_str(awg["last_config"].as_str().unwrap()).unwrap();
        last["junk"] = serde_json::json!({"nested": [1, 2]});
        awg["last_config"] = Value::from(last.to_string());

        let uri = codec::encode(&value).unwrap();
        let decoded = VpnLink::decode(&uri).unwrap();
        let block = &decoded.containers[0].awg;
        assert_eq!(block.params, ObfuscationParams::builtin_defaults());
        assert_eq!(block.extra["mtu"], "1280");
        assert_eq!(block.extra.len(), 2);

        let last = block.parse_last_config().unwrap();
        assert_eq!(last.params, ObfuscationParams::builtin_defaults());
        assert_eq!(last.extra["junk"]["nested"][1], 2);

        let reencoded = serde_json::to_value(&decoded).unwrap();
        assert_eq!(reencoded["containers"][0]["awg"]["isThirdPartyConfig"], true);
    }
}
