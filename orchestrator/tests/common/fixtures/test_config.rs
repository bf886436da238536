//! Test configuration builder writing TOML files to a temp directory

use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Builder for a config directory
pub struct TestConfigBuilder {
    temp_dir: TempDir,
    main_toml: String,
    pools: Vec<(String, String)>,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        Self {
            temp_dir,
            main_toml: "host = \"127.0.0.1\"\nport = 8095\n".to_string(),
            pools: Vec::new(),
        }
    }

    /// Replace main.toml
    pub fn with_main_toml(mut self, contents: &str) -> Self {
        self.main_toml = contents.to_string();
        self
    }

    /// Add `<name>.toml` describing one pool connection
    pub fn with_pool(mut self, name: &str, url: &str, api_key: &str) -> Self {
        let contents = format!(
            "[connection]\nurl = \"{}\"\napi_key = \"{}\"\n",
            url, api_key
        );
        self.pools.push((name.to_string(), contents));
        self
    }

    /// Add a raw file to the config directory
    pub fn with_file(mut self, name: &str, contents: &str) -> Self {
        self.pools
            .push((name.trim_end_matches(".toml").to_string(), contents.to_string()));
        self
    }

    pub fn build(self) -> TestConfig {
        let config_dir = self.temp_dir.path().join("config");
        fs::create_dir_all(&config_dir).expect("Failed to create config dir");

        fs::write(config_dir.join("main.toml"), &self.main_toml)
            .expect("Failed to write main.toml");
        for (name, contents) in &self.pools {
            fs::write(config_dir.join(format!("{}.toml", name)), contents)
                .expect("Failed to write pool config");
        }

        TestConfig {
            _temp_dir: self.temp_dir,
            config_dir,
        }
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Config directory that lives as long as this value
pub struct TestConfig {
    _temp_dir: TempDir,
    pub config_dir: PathBuf,
}

impl TestConfig {
    pub fn dir(&self) -> String {
        self.config_dir.to_string_lossy().to_string()
    }
}
