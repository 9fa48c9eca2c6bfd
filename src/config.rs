//! Configuration (spec §4.9, §6): this crate owns only its own `maple` table; the surrounding
//! application loader (an external collaborator) is responsible for reading the rest of the
//! document and handing this crate its section as a `toml::Value`.

use serde::Deserialize;

/// The `maple` configuration table: the pipeline driver's execution order, by handler name.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MapleConfig {
    pub pipeline: Vec<String>,
}

impl MapleConfig {
    /// Extract the `maple` key from a root TOML document. Returns the default (empty pipeline)
    /// if the key is absent, since an application may load this crate without configuring any
    /// handlers at all.
    pub fn from_document(document: &toml::Value) -> Result<Self, toml::de::Error> {
        match document.get("maple") {
            Some(value) => value.clone().try_into(),
            None => Ok(MapleConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_pipeline_array_from_maple_table() {
        let doc: toml::Value = toml::from_str(
            r#"
            [maple]
            pipeline = ["learn", "forward"]
            "#,
        )
        .unwrap();
        let config = MapleConfig::from_document(&doc).unwrap();
        assert_eq!(config.pipeline, vec!["learn".to_string(), "forward".to_string()]);
    }

    #[test]
    fn missing_maple_table_yields_empty_pipeline() {
        let doc: toml::Value = toml::from_str("other = 1").unwrap();
        let config = MapleConfig::from_document(&doc).unwrap();
        assert!(config.pipeline.is_empty());
    }
}
