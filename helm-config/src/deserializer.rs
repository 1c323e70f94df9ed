/// Normalizes currency-keyed maps so `usdt` and `USDT` address the same balance.
pub mod uppercase_key {
    use std::collections::HashMap;

    use serde::de::{Deserialize, Deserializer};

    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<HashMap<String, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de>,
    {
        let raw = HashMap::<String, V>::deserialize(deserializer)?;
        let mut normalized = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            normalized.insert(key.trim().to_ascii_uppercase(), value);
        }
        Ok(normalized)
    }
}
