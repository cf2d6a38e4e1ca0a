use anyhow::Result;
use payorch::Config;
use std::fs;
use std::path::PathBuf;

const CONFIG_FILE_NAME: &str = "config.json";
const HISTORY_FILE_NAME: &str = "history.txt";

pub(crate) struct CliPersistence {
    pub(crate) data_dir: PathBuf,
}

impl CliPersistence {
    /// Loads `config.json` from the data directory, writing the default
    /// configuration there on first run
    pub(crate) fn get_or_create_config(&self) -> Result<Config> {
        let path = self.data_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            return Ok(serde_json::from_str(&contents)?);
        }

        let config = Config::default_config(self.data_dir.to_string_lossy().to_string());
        fs::write(&path, serde_json::to_string_pretty(&config)?)?;
        Ok(config)
    }

    pub(crate) fn history_file(&self) -> String {
        self.data_dir
            .join(HISTORY_FILE_NAME)
            .to_string_lossy()
            .to_string()
    }
}
