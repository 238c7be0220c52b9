use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

pub trait Validatable {
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub gateway: GatewayConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub preprocess: PreprocessConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    pub model_variants: Vec<VariantConfig>,
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Batching settings for a variant, falling back to the gateway-wide block.
    pub fn batching_for<'a>(&'a self, variant: &'a VariantConfig) -> &'a BatchingConfig {
        variant.batching.as_ref().unwrap_or(&self.batching)
    }
}

impl Validatable for GatewayConfig {
    fn validate(&self) -> Result<(), String> {
        if self.request_timeout_ms == 0 {
            return Err("request_timeout_ms must be greater than 0".to_string());
        }
        self.preprocess.validate()?;
        self.batching.validate()?;

        if self.model_variants.is_empty() {
            return Err("at least one model variant must be configured".to_string());
        }

        let mut names = HashSet::new();
        for variant in &self.model_variants {
            if !names.insert(variant.name.as_str()) {
                return Err(format!("duplicate model variant `{}`", variant.name));
            }
            variant
                .validate()
                .map_err(|e| format!("model variant `{}`: {}", variant.name, e))?;
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreprocessConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_preprocess_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_preprocess_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_preprocess_queue_capacity() -> usize {
    64
}

fn default_preprocess_timeout_ms() -> u64 {
    2_000
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            queue_capacity: default_preprocess_queue_capacity(),
            timeout_ms: default_preprocess_timeout_ms(),
        }
    }
}

impl PreprocessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Validatable for PreprocessConfig {
    fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("preprocess.pool_size must be at least 1".to_string());
        }
        if self.timeout_ms == 0 {
            return Err("preprocess.timeout_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchingConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_batch_delay_ms")]
    pub max_batch_delay_ms: u64,
    #[serde(default = "default_executor_timeout_ms")]
    pub executor_timeout_ms: u64,
    #[serde(default = "default_max_inflight_batches")]
    pub max_inflight_batches: usize,
    #[serde(default = "default_batching_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_max_batch_size() -> usize {
    8
}

fn default_max_batch_delay_ms() -> u64 {
    5
}

fn default_executor_timeout_ms() -> u64 {
    1_000
}

fn default_max_inflight_batches() -> usize {
    1
}

fn default_batching_queue_capacity() -> usize {
    1_024
}

fn default_retry_backoff_ms() -> u64 {
    20
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_batch_delay_ms: default_max_batch_delay_ms(),
            executor_timeout_ms: default_executor_timeout_ms(),
            max_inflight_batches: default_max_inflight_batches(),
            queue_capacity: default_batching_queue_capacity(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl BatchingConfig {
    pub fn max_batch_delay(&self) -> Duration {
        Duration::from_millis(self.max_batch_delay_ms)
    }

    pub fn executor_timeout(&self) -> Duration {
        Duration::from_millis(self.executor_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Validatable for BatchingConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be at least 1".to_string());
        }
        if self.executor_timeout_ms == 0 {
            return Err("executor_timeout_ms must be greater than 0".to_string());
        }
        if self.max_inflight_batches == 0 {
            return Err("max_inflight_batches must be at least 1".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReadinessConfig {
    #[serde(default = "default_readiness_retries")]
    pub max_retries: u32,
    #[serde(default = "default_readiness_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_readiness_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_readiness_retries() -> u32 {
    10
}

fn default_readiness_initial_delay_ms() -> u64 {
    50
}

fn default_readiness_max_delay_ms() -> u64 {
    1_000
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_retries: default_readiness_retries(),
            initial_delay_ms: default_readiness_initial_delay_ms(),
            max_delay_ms: default_readiness_max_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VariantConfig {
    pub name: String,
    pub executor: ExecutorConfig,
    pub model: ModelConfig,
    pub input: InputConfig,
    pub task: TaskConfig,
    #[serde(default)]
    pub batching: Option<BatchingConfig>,
}

impl Validatable for VariantConfig {
    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        if let Some(batching) = &self.batching {
            batching.validate()?;
        }
        self.executor.validate()?;
        self.model.validate()?;
        self.input.validate()?;
        self.task.validate()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ExecutorConfig {
    Grpc {
        url: String,
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
    },
    Http {
        url: String,
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
    },
    #[cfg(feature = "tensorrt")]
    Ort {
        model_dir: PathBuf,
        onnx_file: String,
        #[serde(default = "default_model_instances")]
        num_instances: usize,
    },
}

fn default_connect_timeout_ms() -> u64 {
    1_000
}

#[cfg(feature = "tensorrt")]
fn default_model_instances() -> usize {
    1
}

impl ExecutorConfig {
    pub fn transport(&self) -> &'static str {
        match self {
            ExecutorConfig::Grpc { .. } => "grpc",
            ExecutorConfig::Http { .. } => "http",
            #[cfg(feature = "tensorrt")]
            ExecutorConfig::Ort { .. } => "ort",
        }
    }

    #[cfg(feature = "tensorrt")]
    pub fn get_model_path(&self) -> Option<PathBuf> {
        match self {
            ExecutorConfig::Ort {
                model_dir,
                onnx_file,
                ..
            } => Some(model_dir.join(onnx_file)),
            _ => None,
        }
    }
}

impl Validatable for ExecutorConfig {
    fn validate(&self) -> Result<(), String> {
        match self {
            ExecutorConfig::Grpc { url, .. } | ExecutorConfig::Http { url, .. } => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(format!("executor url must be http(s): {}", url));
                }
                Ok(())
            }
            #[cfg(feature = "tensorrt")]
            ExecutorConfig::Ort { num_instances, .. } => {
                if *num_instances == 0 {
                    return Err("executor.num_instances must be at least 1".to_string());
                }
                match self.get_model_path() {
                    Some(path) if !path.exists() => {
                        Err(format!("Model file not found: {:?}", path))
                    }
                    _ => Ok(()),
                }
            }
        }
    }
}

/// Names the model on the serving backend and its tensor bindings.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default = "default_input_name")]
    pub input_name: String,
    #[serde(default)]
    pub output_name: Option<String>,
}

fn default_input_name() -> String {
    "input".to_string()
}

impl Validatable for ModelConfig {
    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("model.name must not be empty".to_string());
        }
        if self.input_name.trim().is_empty() {
            return Err("model.input_name must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    Stretch,
    Letterbox,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColorOrder {
    Rgb,
    Bgr,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    Nchw,
    Nhwc,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_resize_mode")]
    pub resize: ResizeMode,
    #[serde(default = "default_color_order")]
    pub color_order: ColorOrder,
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    #[serde(default = "default_std")]
    pub std: [f32; 3],
    #[serde(default = "default_layout")]
    pub layout: TensorLayout,
    #[serde(default = "default_max_source_pixels")]
    pub max_source_pixels: u64,
    #[serde(default = "default_min_source_side")]
    pub min_source_side: u32,
}

fn default_resize_mode() -> ResizeMode {
    ResizeMode::Stretch
}

fn default_color_order() -> ColorOrder {
    ColorOrder::Rgb
}

fn default_mean() -> [f32; 3] {
    [0.0, 0.0, 0.0]
}

fn default_std() -> [f32; 3] {
    [1.0, 1.0, 1.0]
}

fn default_layout() -> TensorLayout {
    TensorLayout::Nchw
}

fn default_max_source_pixels() -> u64 {
    8192 * 8192
}

fn default_min_source_side() -> u32 {
    1
}

impl Validatable for InputConfig {
    fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err(format!(
                "input size must be positive, got {}x{}",
                self.width, self.height
            ));
        }
        if self.std.iter().any(|s| !s.is_finite() || *s == 0.0) {
            return Err(format!("input.std must be finite and non-zero: {:?}", self.std));
        }
        if self.mean.iter().any(|m| !m.is_finite()) {
            return Err(format!("input.mean must be finite: {:?}", self.mean));
        }
        if self.max_source_pixels == 0 {
            return Err("input.max_source_pixels must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskConfig {
    Detection {
        #[serde(default = "default_score_threshold")]
        score_threshold: f32,
        #[serde(default = "default_iou_threshold")]
        iou_threshold: f32,
        #[serde(default)]
        max_detections: usize,
        #[serde(default)]
        num_classes: Option<usize>,
        #[serde(default)]
        num_landmarks: usize,
        /// The head carries a trailing mask probability channel.
        #[serde(default)]
        mask: bool,
    },
    Embedding {
        #[serde(default)]
        dim: Option<usize>,
        #[serde(default = "default_normalize")]
        normalize: bool,
    },
}

fn default_score_threshold() -> f32 {
    0.5
}

fn default_iou_threshold() -> f32 {
    0.45
}

fn default_normalize() -> bool {
    true
}

impl TaskConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskConfig::Detection { .. } => "detection",
            TaskConfig::Embedding { .. } => "embedding",
        }
    }
}

impl Validatable for TaskConfig {
    fn validate(&self) -> Result<(), String> {
        match self {
            TaskConfig::Detection {
                score_threshold,
                iou_threshold,
                num_classes,
                ..
            } => {
                if !(0.0..=1.0).contains(score_threshold) {
                    return Err(format!(
                        "task.score_threshold must be within [0, 1], got {}",
                        score_threshold
                    ));
                }
                if !(0.0..=1.0).contains(iou_threshold) {
                    return Err(format!(
                        "task.iou_threshold must be within [0, 1], got {}",
                        iou_threshold
                    ));
                }
                if *num_classes == Some(0) {
                    return Err("task.num_classes must be at least 1".to_string());
                }
                Ok(())
            }
            TaskConfig::Embedding { dim, .. } => {
                if *dim == Some(0) {
                    return Err("task.dim must be at least 1".to_string());
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("no current directory: {}", e)))?;
    load_configuration(base_path.join("configuration"))
}

pub fn load_configuration(configuration_directory: PathBuf) -> Result<Config, config::ConfigError> {
    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("GW")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;
    if let Err(e) = config.gateway.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}
