use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::model::ModelSpec;
use crate::PipelineError;

/// Sidecar written next to the exported weights: the model spec plus the full
/// tensor table a runtime needs to rebuild the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub spec: ModelSpec,
    pub tensors: Vec<TensorInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<usize>,
    pub dtype: String,
}

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub artifact: PathBuf,
    pub verified: bool,
}

/// Collect the best (else last) checkpoint of a finished run into the
/// interchange artifact `phonemizer.safetensors` + `phonemizer.json`, then
/// verify it. Verification failure is a warning, not an error: the training
/// phase already succeeded.
pub fn export_run(run_dir: &Path) -> crate::Result<ExportReport> {
    let spec: ModelSpec =
        serde_json::from_str(&fs::read_to_string(run_dir.join("model_spec.json")).map_err(
            |e| PipelineError::Data(format!("cannot read model spec in {}: {e}", run_dir.display())),
        )?)?;

    let best = run_dir.join("checkpoints/best.safetensors");
    let last = run_dir.join("checkpoints/last.safetensors");
    let checkpoint = if best.exists() {
        best
    } else if last.exists() {
        last
    } else {
        return Err(PipelineError::Data(format!(
            "no checkpoint found under {}",
            run_dir.display()
        )));
    };

    let artifact = run_dir.join("phonemizer.safetensors");
    fs::copy(&checkpoint, &artifact)?;

    let manifest = ExportManifest {
        tensors: spec
            .expected_tensors()
            .into_iter()
            .map(|(name, dims)| TensorInfo {
                name,
                dims,
                dtype: "F32".to_string(),
            })
            .collect(),
        spec,
    };
    fs::write(
        run_dir.join("phonemizer.json"),
        serde_json::to_string_pretty(&manifest)?,
    )?;

    println!("Exported model to {}", artifact.display());
    let verified = verify_artifact(&artifact, &manifest.spec);
    if verified {
        println!("Export verification passed");
    }

    Ok(ExportReport { artifact, verified })
}

/// Re-load the artifact through the safetensors parser and check every
/// expected tensor name, shape and dtype. Mismatches are logged as warnings.
pub fn verify_artifact(artifact: &Path, spec: &ModelSpec) -> bool {
    let tensors = match candle_core::safetensors::load(artifact, &Device::Cpu) {
        Ok(tensors) => tensors,
        Err(e) => {
            eprintln!(
                "Warning: exported artifact {} does not parse as safetensors: {e}",
                artifact.display()
            );
            return false;
        }
    };

    let expected = spec.expected_tensors();
    let mut ok = true;
    for (name, dims) in &expected {
        match tensors.get(name) {
            None => {
                eprintln!("Warning: exported artifact is missing tensor '{name}'");
                ok = false;
            }
            Some(tensor) if tensor.dims() != dims.as_slice() => {
                eprintln!(
                    "Warning: tensor '{name}' has shape {:?}, expected {dims:?}",
                    tensor.dims()
                );
                ok = false;
            }
            Some(tensor) if tensor.dtype() != DType::F32 => {
                eprintln!(
                    "Warning: tensor '{name}' has dtype {:?}, expected F32",
                    tensor.dtype()
                );
                ok = false;
            }
            Some(_) => {}
        }
    }
    if tensors.len() != expected.len() {
        eprintln!(
            "Warning: exported artifact holds {} tensors, expected {}",
            tensors.len(),
            expected.len()
        );
        ok = false;
    }
    if !ok {
        eprintln!(
            "Warning: export verification failed for {}; the training phase still succeeded",
            artifact.display()
        );
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelType;
    use crate::model::G2pTransformer;
    use candle_nn::{VarBuilder, VarMap};

    fn tiny_spec() -> ModelSpec {
        ModelSpec {
            model_type: ModelType::Forward,
            d_model: 16,
            layers: 1,
            heads: 2,
            dropout: 0.0,
            vocab_size: 7,
            phoneme_size: 5,
            seq_len: 4,
        }
    }

    fn write_run_dir(spec: &ModelSpec) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("checkpoints")).unwrap();
        fs::write(
            dir.path().join("model_spec.json"),
            serde_json::to_string_pretty(spec).unwrap(),
        )
        .unwrap();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _model = G2pTransformer::new(spec, vb).unwrap();
        varmap
            .save(dir.path().join("checkpoints/best.safetensors"))
            .unwrap();
        dir
    }

    #[test]
    fn export_verifies_matching_checkpoint() {
        let spec = tiny_spec();
        let dir = write_run_dir(&spec);
        let report = export_run(dir.path()).unwrap();
        assert!(report.verified);
        assert!(report.artifact.exists());
        assert!(dir.path().join("phonemizer.json").exists());
    }

    #[test]
    fn verification_flags_shape_mismatch_without_failing() {
        let spec = tiny_spec();
        let dir = write_run_dir(&spec);
        let report = export_run(dir.path()).unwrap();

        let mut wrong = spec.clone();
        wrong.d_model = 32;
        assert!(!verify_artifact(&report.artifact, &wrong));
    }

    #[test]
    fn export_without_checkpoints_is_a_data_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("model_spec.json"),
            serde_json::to_string_pretty(&tiny_spec()).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            export_run(dir.path()),
            Err(PipelineError::Data(_))
        ));
    }
}
