use anyhow::Result;
use std::fs;
use std::path::Path;

const DEFAULT_CONFIG: &str = r#"# Volley stress test
# Run with: volley run volley.yaml

stages:
  - { duration: 3m, target: 200 }
  - { duration: 8m30s, target: 150 }
  - { duration: 1m, target: 30 }
  - { duration: 30s, target: 0 }

thresholds:
  "group_duration{group:::Metadata}": ["avg<200"]
  http_req_failed: ["rate<0.01"]
  "http_req_duration{group:::Metadata}": ["p(95)<200"]
  check_failure_rate:
    - "rate<0.01"
    # stop the whole run early if more than 5% of groups fail their checks
    - { threshold: "rate<=0.05", abortOnFail: true }

gracefulStop: 30s

plan:
  failureMetric: check_failure_rate
  sleep: { min: 0s, max: 3s }
  groups:
    - name: Metadata
      requests:
        - { method: GET, url: "https://localhost:8443/metadata/1" }
      checks:
        - { name: "status is 200", status: 200 }
        - name: "verify valid response"
          json: { path: "Type", equals: "application/vnd.apple.mpegurl" }
    - name: Content
      requests:
        - { method: GET, url: "https://localhost:8443/content/1" }
      checks:
        - { name: "status is 200", status: 200 }
"#;

/// Write a starter configuration.
pub fn run_init(output: Option<&Path>) -> Result<()> {
    let config_path = output.unwrap_or(Path::new("volley.yaml"));

    if config_path.exists() {
        anyhow::bail!(
            "File already exists: {:?}. Remove it first or choose a different output path.",
            config_path
        );
    }

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    fs::write(config_path, DEFAULT_CONFIG)?;
    println!("✓ Created {}", config_path.display());

    println!("\nEdit the plan URLs, then run your test with:");
    println!("  volley run {}", config_path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::Config;
    use tempfile::TempDir;

    #[test]
    fn test_run_init_creates_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("volley.yaml");

        run_init(Some(&path)).unwrap();

        assert!(path.exists());
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("stages:"));
        assert!(content.contains("plan:"));
    }

    #[test]
    fn test_run_init_fails_if_exists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("volley.yaml");
        fs::write(&path, "existing content").unwrap();

        assert!(run_init(Some(&path)).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "existing content");
    }

    #[test]
    fn test_default_config_is_runnable() {
        let config: Config = serde_yaml::from_str(DEFAULT_CONFIG).unwrap();
        let options = config.engine_options().unwrap();
        assert_eq!(options.stages.len(), 4);
        assert_eq!(options.thresholds.len(), 5);
        assert_eq!(options.thresholds.iter().filter(|t| t.fatal).count(), 1);
        let plan = config.plan().unwrap();
        assert_eq!(plan.groups.len(), 2);
    }
}
