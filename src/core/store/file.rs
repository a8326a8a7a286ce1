use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{Hsts, OriginRecord, SessionStore};
use crate::core::error::Error;
use crate::core::origin::Origin;
use crate::core::util::lock_unpoisoned;

const HSTS_FILE: &str = "hsts.json";

/// Durable store keeping one JSON document per origin under a directory.
///
/// Writes go to a temporary file that is renamed into place, so a reader sees
/// either the old or the new record. Removing an origin deletes its file.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    io: Mutex<()>,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> crate::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("origins")).map_err(|error| store_error("open", &error))?;
        Ok(Self {
            root,
            io: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn origin_path(&self, origin: &Origin) -> PathBuf {
        let name = format!(
            "{}_{}_{}.json",
            origin.scheme(),
            origin
                .host()
                .replace(|c: char| !c.is_ascii_alphanumeric() && c != '.' && c != '-', "_"),
            origin.port()
        );
        self.root.join("origins").join(name)
    }

    fn read_json<T: serde::de::DeserializeOwned + Default>(
        path: &Path,
        operation: &'static str,
    ) -> crate::Result<T> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|error| Error::store(operation, format!("{}: {error}", path.display()))),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(T::default()),
            Err(error) => Err(store_error(operation, &error)),
        }
    }

    fn write_json<T: serde::Serialize>(
        path: &Path,
        value: &T,
        operation: &'static str,
    ) -> crate::Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|error| Error::store(operation, error.to_string()))?;
        let temporary = path.with_extension("json.tmp");
        let mut file =
            fs::File::create(&temporary).map_err(|error| store_error(operation, &error))?;
        file.write_all(&bytes)
            .and_then(|()| file.sync_all())
            .map_err(|error| store_error(operation, &error))?;
        fs::rename(&temporary, path).map_err(|error| store_error(operation, &error))
    }

    fn remove_file(path: &Path, operation: &'static str) -> crate::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(store_error(operation, &error)),
        }
    }
}

impl SessionStore for FileStore {
    fn load_origin(&self, origin: &Origin) -> crate::Result<OriginRecord> {
        let _guard = lock_unpoisoned(&self.io);
        Self::read_json(&self.origin_path(origin), "load_origin")
    }

    fn save_origin(&self, origin: &Origin, record: OriginRecord) -> crate::Result<()> {
        let _guard = lock_unpoisoned(&self.io);
        Self::write_json(&self.origin_path(origin), &record, "save_origin")
    }

    fn remove_origin(&self, origin: &Origin) -> crate::Result<()> {
        let _guard = lock_unpoisoned(&self.io);
        Self::remove_file(&self.origin_path(origin), "remove_origin")
    }

    fn load_hsts(&self, host: &str) -> crate::Result<Option<Hsts>> {
        let _guard = lock_unpoisoned(&self.io);
        let mut table: BTreeMap<String, Hsts> =
            Self::read_json(&self.root.join(HSTS_FILE), "load_hsts")?;
        Ok(table.remove(host))
    }

    fn save_hsts(&self, host: &str, entry: Option<Hsts>) -> crate::Result<()> {
        let _guard = lock_unpoisoned(&self.io);
        let path = self.root.join(HSTS_FILE);
        let mut table: BTreeMap<String, Hsts> = Self::read_json(&path, "save_hsts")?;
        match entry {
            Some(entry) => {
                table.insert(host.to_owned(), entry);
            }
            None => {
                table.remove(host);
            }
        }
        Self::write_json(&path, &table, "save_hsts")
    }
}

fn store_error(operation: &'static str, error: &io::Error) -> Error {
    Error::store(operation, error.to_string())
}
