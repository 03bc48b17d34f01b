/// Telemetry sideband for external dashboards
///
/// Snapshots are plain files under the configured directory, one per
/// category/name pair (`network/stats`, `pool/stats`, `pool/blocks`,
/// `global/stats_mod`). Each write goes to a temp file first and is renamed
/// into place so pollers never observe a half-written snapshot.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    Network,
    Pool,
    Global,
}

impl Category {
    fn dir(&self) -> &'static str {
        match self {
            Category::Network => "network",
            Category::Pool => "pool",
            Category::Global => "global",
        }
    }
}

pub struct Api {
    base: PathBuf,
}

impl Api {
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        for cat in [Category::Network, Category::Pool, Category::Global] {
            std::fs::create_dir_all(base.join(cat.dir()))
                .with_context(|| format!("couldn't create api directory {:?}", base))?;
        }
        tracing::info!("telemetry api writing to {:?}", base);
        Ok(Self { base })
    }

    pub fn set(&self, category: Category, name: &str, value: &Value) {
        let dir = self.base.join(category.dir());
        let target = dir.join(name);
        let tmp = dir.join(format!(".{}.tmp", name));

        let write: Result<()> = (|| {
            std::fs::write(&tmp, serde_json::to_vec(value)?)?;
            std::fs::rename(&tmp, &target)?;
            Ok(())
        })();

        if let Err(e) = write {
            tracing::warn!("couldn't write api snapshot {:?}: {}", target, e);
        }
    }
}
