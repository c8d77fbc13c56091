use std::path::{Path, PathBuf};

use candle_nn::VarMap;

use crate::error::{Result, Wav2LetterError};

/// Weight files named by epoch inside one directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    directory: PathBuf,
}

impl CheckpointStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn file_name(epoch: u64) -> String {
        format!("weights-epoch{epoch}.safetensors")
    }

    pub fn path(&self, epoch: u64) -> PathBuf {
        self.directory.join(Self::file_name(epoch))
    }

    pub fn exists(&self, epoch: u64) -> bool {
        self.path(epoch).is_file()
    }

    /// Epochs with a checkpoint file in the directory, ascending. A missing
    /// directory has none.
    pub fn epochs(&self) -> Result<Vec<u64>> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Wav2LetterError::io("list checkpoint directory", e)),
        };
        let mut epochs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Wav2LetterError::io("list checkpoint directory", e))?;
            let name = entry.file_name();
            let epoch = name
                .to_str()
                .and_then(|n| n.strip_prefix("weights-epoch"))
                .and_then(|n| n.strip_suffix(".safetensors"))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(epoch) = epoch {
                epochs.push(epoch);
            }
        }
        epochs.sort_unstable();
        Ok(epochs)
    }

    /// Writes the weights for `epoch`. Checkpoints are never replaced: an
    /// existing file for that epoch is a configuration error.
    pub fn save(&self, varmap: &VarMap, epoch: u64) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.directory)
            .map_err(|e| Wav2LetterError::io("create checkpoint directory", e))?;
        let path = self.path(epoch);
        if path.exists() {
            return Err(Wav2LetterError::configuration(format!(
                "checkpoint for epoch {epoch} already exists at {}",
                path.display()
            )));
        }

        let partial = path.with_extension("safetensors.partial");
        varmap
            .save(&partial)
            .map_err(|e| Wav2LetterError::runtime("save checkpoint", e))?;
        std::fs::rename(&partial, &path)
            .map_err(|e| Wav2LetterError::io("move checkpoint into place", e))?;
        tracing::info!(path = %path.display(), epoch, "checkpoint saved");
        Ok(path)
    }

    /// Overwrites every variable of `varmap` with the values stored for `epoch`.
    pub fn load(&self, varmap: &VarMap, epoch: u64) -> Result<()> {
        let path = self.path(epoch);
        if !path.is_file() {
            return Err(Wav2LetterError::configuration(format!(
                "no checkpoint for epoch {epoch} at {}",
                path.display()
            )));
        }
        let mut varmap = varmap.clone();
        varmap
            .load(&path)
            .map_err(|e| Wav2LetterError::runtime("load checkpoint", e))?;
        tracing::info!(path = %path.display(), epoch, "checkpoint loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{Init, VarBuilder};

    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "wav2letter_rs_checkpoint_{name}_{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn weight(varmap: &VarMap) -> Vec<f32> {
        let data = varmap.data().lock().unwrap();
        let values = data["layer.weight"].as_tensor().to_vec1().unwrap();
        values
    }

    #[test]
    fn file_names_are_keyed_by_epoch() {
        let store = CheckpointStore::new("nets");
        assert_eq!(CheckpointStore::file_name(12), "weights-epoch12.safetensors");
        assert_eq!(store.path(3), Path::new("nets").join("weights-epoch3.safetensors"));
    }

    #[test]
    fn save_then_load_restores_weights_and_never_overwrites() {
        let dir = temp_dir("roundtrip");
        let store = CheckpointStore::new(&dir);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(3, "layer.weight", Init::Const(1.5)).unwrap();

        let saved = store.save(&varmap, 2).unwrap();
        assert_eq!(saved, store.path(2));
        assert!(store.exists(2));
        assert_eq!(store.epochs().unwrap(), vec![2]);

        {
            let data = varmap.data().lock().unwrap();
            let zeros = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();
            data["layer.weight"].set(&zeros).unwrap();
        }
        // Second save for the same epoch fails, the 1.5 weights stay on disk.
        assert!(matches!(
            store.save(&varmap, 2),
            Err(Wav2LetterError::Configuration { .. })
        ));

        store.load(&varmap, 2).unwrap();
        assert_eq!(weight(&varmap), vec![1.5, 1.5, 1.5]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn epochs_ignore_unrelated_files() {
        let dir = temp_dir("epochs");
        std::fs::create_dir_all(&dir).unwrap();
        for name in [
            "weights-epoch10.safetensors",
            "weights-epoch3.safetensors",
            "weights-epoch4.safetensors.partial",
            "notes.txt",
        ] {
            std::fs::write(dir.join(name), b"").unwrap();
        }
        assert_eq!(CheckpointStore::new(&dir).epochs().unwrap(), vec![3, 10]);
        assert!(CheckpointStore::new(dir.join("absent")).epochs().unwrap().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_checkpoint_is_a_configuration_error() {
        let store = CheckpointStore::new(temp_dir("missing"));
        let err = store.load(&VarMap::new(), 7).unwrap_err();
        assert!(matches!(err, Wav2LetterError::Configuration { .. }));
    }
}
