use super::{ConnectOptions, Engine};

pub fn parse_engine(s: &str) -> Option<Engine> {
    match s.to_lowercase().as_str() {
        "kafka" => Some(Engine::Kafka),
        #[cfg(any(test, feature = "transport-mock"))]
        "mock" => Some(Engine::Mock),
        _ => None,
    }
}

/// Builds connect options from `key=value` pairs; entries without `=` are
/// ignored. `bootstrap` seeds `bootstrap.servers` unless a pair overrides it.
pub fn parse_connect_kv(bootstrap: &str, pairs: &[String]) -> ConnectOptions {
    let mut opts = ConnectOptions::default().with("bootstrap.servers", bootstrap);
    for p in pairs {
        if let Some((k, v)) = p.split_once('=') {
            opts.params.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    opts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engines_parse_case_insensitively() {
        assert_eq!(parse_engine("Kafka"), Some(Engine::Kafka));
        assert_eq!(parse_engine("mock"), Some(Engine::Mock));
        assert_eq!(parse_engine("zenoh"), None);
    }

    #[test]
    fn pairs_override_bootstrap() {
        let opts = parse_connect_kv(
            "localhost:9092",
            &[
                "linger.ms=5".to_string(),
                "garbage".to_string(),
                "bootstrap.servers=broker:9093".to_string(),
            ],
        );
        assert_eq!(opts.get("linger.ms"), Some("5"));
        assert_eq!(opts.get("bootstrap.servers"), Some("broker:9093"));
        assert_eq!(opts.params.len(), 2);
    }
}
