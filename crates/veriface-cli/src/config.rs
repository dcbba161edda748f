use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use veriface_core::evaluation::{TrialConfig, DEFAULT_IMPOSTER_CAP};
use veriface_core::EmbeddingStore;

/// Resolved CLI configuration.
///
/// Sources, lowest precedence first: built-in defaults, the TOML file named by
/// `--config` or `VERIFACE_CONFIG`, then `VERIFACE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Embedding store file.
    pub store_path: PathBuf,
    pub backup_dir: PathBuf,
    /// Enrollment root: one subdirectory of images per identity.
    pub faces_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Where `evaluate` writes its JSON outputs.
    pub results_dir: PathBuf,
    /// Euclidean distance below which a probe is accepted.
    pub match_threshold: f32,
    pub process_every_n_frames: usize,
    /// Keep at most this many backups; `None` keeps all.
    pub backup_retention: Option<usize>,
    pub detector_confidence: f32,
    pub min_images: usize,
    pub identities_per_trial: usize,
    pub num_trials: usize,
    pub imposter_cap: usize,
    pub seed: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    data_dir: Option<PathBuf>,
    store_path: Option<PathBuf>,
    backup_dir: Option<PathBuf>,
    faces_dir: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    results_dir: Option<PathBuf>,
    match_threshold: Option<f32>,
    process_every_n_frames: Option<usize>,
    backup_retention: Option<usize>,
    detector_confidence: Option<f32>,
    evaluation: EvaluationSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct EvaluationSection {
    min_images: Option<usize>,
    identities_per_trial: Option<usize>,
    num_trials: Option<usize>,
    imposter_cap: Option<usize>,
    seed: Option<u64>,
}

impl Config {
    /// Load from the given file (or `VERIFACE_CONFIG`) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("VERIFACE_CONFIG").ok().map(PathBuf::from));

        let text = match &path {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?,
            ),
            None => None,
        };

        let config = Self::from_sources(text.as_deref(), |key| std::env::var(key).ok())?;
        tracing::debug!(?config, "configuration loaded");
        Ok(config)
    }

    /// Resolve from optional TOML text and an environment lookup.
    pub fn from_sources(toml_text: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file: FileConfig = match toml_text {
            Some(text) => toml::from_str(text).context("parsing config file")?,
            None => FileConfig::default(),
        };
        let eval = &file.evaluation;

        let data_dir = env_path(&env, "VERIFACE_DATA_DIR")
            .or(file.data_dir.clone())
            .unwrap_or_else(|| default_data_dir(&env));

        let config = Self {
            store_path: env_path(&env, "VERIFACE_STORE_PATH")
                .or(file.store_path.clone())
                .unwrap_or_else(|| data_dir.join("known_faces.json")),
            backup_dir: env_path(&env, "VERIFACE_BACKUP_DIR")
                .or(file.backup_dir.clone())
                .unwrap_or_else(|| data_dir.join("model_backups")),
            faces_dir: env_path(&env, "VERIFACE_FACES_DIR")
                .or(file.faces_dir.clone())
                .unwrap_or_else(|| data_dir.join("known_faces")),
            model_dir: env_path(&env, "VERIFACE_MODEL_DIR")
                .or(file.model_dir.clone())
                .unwrap_or_else(veriface_core::default_model_dir),
            results_dir: env_path(&env, "VERIFACE_RESULTS_DIR")
                .or(file.results_dir.clone())
                .unwrap_or_else(|| data_dir.join("results")),
            match_threshold: env_parse(&env, "VERIFACE_MATCH_THRESHOLD")
                .or(file.match_threshold)
                .unwrap_or(veriface_core::DEFAULT_MATCH_THRESHOLD),
            process_every_n_frames: env_parse(&env, "VERIFACE_PROCESS_EVERY_N_FRAMES")
                .or(file.process_every_n_frames)
                .unwrap_or(veriface_core::live::DEFAULT_PROCESS_EVERY),
            backup_retention: env_parse(&env, "VERIFACE_BACKUP_RETENTION").or(file.backup_retention),
            detector_confidence: env_parse(&env, "VERIFACE_DETECTOR_CONFIDENCE")
                .or(file.detector_confidence)
                .unwrap_or(veriface_core::detector::DEFAULT_DETECTION_CONFIDENCE),
            min_images: env_parse(&env, "VERIFACE_MIN_IMAGES")
                .or(eval.min_images)
                .unwrap_or(5),
            identities_per_trial: env_parse(&env, "VERIFACE_IDENTITIES_PER_TRIAL")
                .or(eval.identities_per_trial)
                .unwrap_or(10),
            num_trials: env_parse(&env, "VERIFACE_NUM_TRIALS")
                .or(eval.num_trials)
                .unwrap_or(50),
            imposter_cap: env_parse(&env, "VERIFACE_IMPOSTER_CAP")
                .or(eval.imposter_cap)
                .unwrap_or(DEFAULT_IMPOSTER_CAP),
            seed: env_parse(&env, "VERIFACE_SEED").or(eval.seed),
            data_dir,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.match_threshold.is_finite() || self.match_threshold < 0.0 {
            bail!("match_threshold must be finite and non-negative, got {}", self.match_threshold);
        }
        if !(0.0..=1.0).contains(&self.detector_confidence) {
            bail!("detector_confidence must be within [0, 1], got {}", self.detector_confidence);
        }
        if self.backup_retention == Some(0) {
            bail!("backup_retention must be at least 1 when set");
        }
        if self.process_every_n_frames == 0 {
            bail!("process_every_n_frames must be at least 1");
        }
        for (name, value) in [
            ("min_images", self.min_images),
            ("identities_per_trial", self.identities_per_trial),
            ("num_trials", self.num_trials),
            ("imposter_cap", self.imposter_cap),
        ] {
            if value == 0 {
                bail!("{name} must be at least 1");
            }
        }
        Ok(())
    }

    pub fn store(&self) -> EmbeddingStore {
        EmbeddingStore::new(&self.store_path, &self.backup_dir).with_retention(self.backup_retention)
    }

    pub fn trial_config(&self) -> TrialConfig {
        TrialConfig {
            min_images_per_identity: self.min_images,
            identities_per_trial: self.identities_per_trial,
            num_trials: self.num_trials,
            imposter_cap: self.imposter_cap,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("veriface")
}

fn env_path(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<PathBuf> {
    env(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
