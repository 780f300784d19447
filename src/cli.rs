use crate::db::DEFAULT_DATABASE_URL;
use crate::probe::{StorageDomains, DEFAULT_STORAGE_DOMAIN};
use clap::Parser;
use std::path::PathBuf;

/// Common command-line arguments that can be shared between different apps
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Recordings database (a path, optionally prefixed with `sqlite://`)
    #[arg(long, env = "DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    pub database_url: String,

    /// Directory holding the persistent duration cache
    #[arg(long, env = "DURATION_CACHE_DIR", default_value = ".cache")]
    pub cache_dir: PathBuf,

    /// ffprobe executable
    #[arg(long, env = "FFPROBE_PATH", default_value = "ffprobe")]
    pub ffprobe_path: String,

    /// Storage hosts whose URLs are still probeable, comma separated
    #[arg(
        long,
        env = "STORAGE_DOMAINS",
        value_delimiter = ',',
        default_value = DEFAULT_STORAGE_DOMAIN
    )]
    pub storage_domains: Vec<String>,

    /// Timezone
    #[arg(long, env = "TIMEZONE")]
    pub timezone: Option<String>,
}

impl CommonArgs {
    pub fn domains(&self) -> StorageDomains {
        StorageDomains::new(&self.storage_domains)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        common: CommonArgs,
    }

    #[test]
    fn parses_domain_list() {
        let cli = TestCli::parse_from([
            "test",
            "--database-url",
            "sqlite://data/test.db",
            "--storage-domains",
            "amazonaws.com,storage.example.com",
        ]);
        assert_eq!(cli.common.database_url, "sqlite://data/test.db");
        assert!(cli
            .common
            .domains()
            .is_probeable("https://cdn.storage.example.com/a.webm"));
        assert_eq!(cli.common.domains().domains().len(), 2);
    }
}
