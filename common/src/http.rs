use serde::{Deserialize, Serialize};

/// Hyperparameters of the remote classifier, as sent to `POST /new` and
/// returned by `GET /info`. Missing optional fields take server defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hashtables: u32,
    pub addresses: u32,
    pub bleach: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_size: Option<(u32, u32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainQuery {
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifyResponse {
    pub label: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_are_omitted_when_absent() {
        let cfg = ServiceConfig {
            hashtables: 35,
            addresses: 21,
            bleach: 0,
            target_size: None,
            mapping: None,
        };
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json, serde_json::json!({"hashtables": 35, "addresses": 21, "bleach": 0}));
    }

    #[test]
    fn info_payload_round_trips_target_size_as_pair() {
        let body = r#"{"hashtables":2,"addresses":2,"bleach":1,"target_size":[2,2],"mapping":[3,1,0,2]}"#;
        let cfg: ServiceConfig = serde_json::from_str(body).unwrap();
        assert_eq!(cfg.target_size, Some((2, 2)));
        assert_eq!(cfg.mapping.as_deref(), Some(&[3, 1, 0, 2][..]));
    }
}
