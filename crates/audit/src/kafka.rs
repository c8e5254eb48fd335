use std::collections::HashMap;
use std::fs;

/// Reads a Java-style `.properties` file into librdkafka settings.
pub fn load_kafka_config_from_file(
    properties_file_path: &str,
) -> Result<HashMap<String, String>, std::io::Error> {
    let kafka_properties = fs::read_to_string(properties_file_path)?;
    Ok(parse_properties(&kafka_properties))
}

fn parse_properties(kafka_properties: &str) -> HashMap<String, String> {
    let mut config = HashMap::new();

    for line in kafka_properties.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            config.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_comments_and_blank_lines() {
        let config = parse_properties(
            "# brokers\nbootstrap.servers = localhost:9092\n\ngroup.id=bundler\nbroken line\n",
        );
        assert_eq!(config.len(), 2);
        assert_eq!(config["bootstrap.servers"], "localhost:9092");
        assert_eq!(config["group.id"], "bundler");
    }

    #[test]
    fn reads_from_disk() {
        let path = std::env::temp_dir().join(format!("bundler-kafka-{}.properties", std::process::id()));
        fs::write(&path, "acks=all\n").unwrap();
        let config = load_kafka_config_from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config["acks"], "all");
        fs::remove_file(path).unwrap();

        assert!(load_kafka_config_from_file("/nonexistent/bundler.properties").is_err());
    }
}
