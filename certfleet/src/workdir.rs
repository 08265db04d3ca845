use std::path::{Path, PathBuf};

use crate::store::CertStore;

/// Layout of the state directory.
#[derive(Debug, Clone)]
pub struct WorkDir {
    workdir: PathBuf,
}

impl WorkDir {
    pub fn new(workdir: impl AsRef<Path>) -> Self {
        Self {
            workdir: workdir.as_ref().to_path_buf(),
        }
    }

    pub fn workdir(&self) -> &PathBuf {
        &self.workdir
    }

    pub fn account_credentials_path(&self) -> PathBuf {
        self.workdir.join("credentials.json")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.workdir.join("certs")
    }

    pub fn cert_store(&self) -> CertStore {
        CertStore::new(self.certs_dir())
    }
}
