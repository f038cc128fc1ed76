//! Binary persistence of run state with `bincode`.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

pub(crate) fn save<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path)
        .map_err(|e| Error::Persistence(format!("failed to create {}: {e}", path.display())))?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, value)
        .map_err(|e| Error::Persistence(format!("failed to serialize {}: {e}", path.display())))?;
    writer.flush()?;
    Ok(())
}

pub(crate) fn load<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| Error::Persistence(format!("failed to open {}: {e}", path.display())))?;
    bincode::deserialize_from(BufReader::new(file))
        .map_err(|e| Error::Persistence(format!("failed to deserialize {}: {e}", path.display())))
}

pub(crate) fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
