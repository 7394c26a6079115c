use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::domain::assignor::AssignorStrategy;
use crate::runtime::backoff::RetryConfig;
use crate::runtime::handoff::DEFAULT_HANDOFF_CAPACITY;

/// 設定ファイルの既定パス。
pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Config は設定ファイルの内容。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
}

/// AppConfig はアプリケーション設定。
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            environment: default_environment(),
        }
    }
}

fn default_app_name() -> String {
    "k1s0-storemanager".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

/// LogConfig はログ出力の設定。
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "json" または "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// KafkaConfig はブローカー接続とコンシューマーグループの設定。
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    #[serde(default = "default_kafka_version")]
    pub version: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
    #[serde(default = "default_assignor")]
    pub assignor: String,
    #[serde(default = "default_initial_offset")]
    pub initial_offset: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            version: default_kafka_version(),
            consumer_group: default_consumer_group(),
            topics: default_topics(),
            assignor: default_assignor(),
            initial_offset: default_initial_offset(),
        }
    }
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_kafka_version() -> String {
    "2.1.1".to_string()
}

fn default_consumer_group() -> String {
    "rocket-storemanager".to_string()
}

fn default_topics() -> Vec<String> {
    vec!["asset-events".to_string()]
}

fn default_assignor() -> String {
    "range".to_string()
}

fn default_initial_offset() -> String {
    "oldest".to_string()
}

/// ConsumerConfig は Worker プールの設定。
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_handoff_capacity")]
    pub handoff_capacity: usize,
    #[serde(default = "default_handler")]
    pub handler: String,
    /// 停止時に Worker の完了を待つ上限秒数。未指定なら無期限に待つ。
    #[serde(default)]
    pub shutdown_timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: RetryYamlConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            handoff_capacity: default_handoff_capacity(),
            handler: default_handler(),
            shutdown_timeout_secs: None,
            retry: RetryYamlConfig::default(),
        }
    }
}

fn default_workers() -> usize {
    3
}

fn default_handoff_capacity() -> usize {
    DEFAULT_HANDOFF_CAPACITY
}

fn default_handler() -> String {
    "forward".to_string()
}

/// RetryYamlConfig は接続エラー時のバックオフ設定。
#[derive(Debug, Clone, Deserialize)]
pub struct RetryYamlConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryYamlConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

/// KafkaVersion はブローカーのプロトコルバージョン。
///
/// 1.0 以降は `X.Y.Z`、それ以前は `0.X.Y.Z` の形式を受け付ける。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaVersion {
    parts: Vec<u32>,
}

impl KafkaVersion {
    pub fn parts(&self) -> &[u32] {
        &self.parts
    }
}

impl FromStr for KafkaVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid kafka version: {s:?}");
        let parts = s
            .trim()
            .split('.')
            .map(|p| {
                if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                p.parse::<u32>().map_err(|_| invalid())
            })
            .collect::<Result<Vec<u32>, String>>()?;

        let valid = match parts.first() {
            Some(0) => parts.len() == 4,
            Some(_) => parts.len() == 3,
            None => false,
        };
        if !valid {
            return Err(invalid());
        }
        Ok(Self { parts })
    }
}

impl fmt::Display for KafkaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.parts.iter().map(u32::to_string).collect();
        f.write_str(&joined.join("."))
    }
}

/// InitialOffset はコミット済みオフセットがない場合の読み出し開始位置。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialOffset {
    Oldest,
    Newest,
}

impl InitialOffset {
    /// librdkafka の `auto.offset.reset` 値。
    pub fn as_auto_offset_reset(self) -> &'static str {
        match self {
            InitialOffset::Oldest => "earliest",
            InitialOffset::Newest => "latest",
        }
    }
}

impl FromStr for InitialOffset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "oldest" => Ok(InitialOffset::Oldest),
            "newest" => Ok(InitialOffset::Newest),
            other => Err(format!("unrecognized initial offset: {other}")),
        }
    }
}

impl fmt::Display for InitialOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitialOffset::Oldest => f.write_str("oldest"),
            InitialOffset::Newest => f.write_str("newest"),
        }
    }
}

/// HandlerKind は Worker が使用するクレームハンドラー。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// 受け渡しチャネルへ転送する
    Forward,
    /// アセットイベントとしてデコードしてディスパッチする
    Dispatch,
}

impl FromStr for HandlerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(HandlerKind::Forward),
            "dispatch" => Ok(HandlerKind::Dispatch),
            other => Err(format!("unrecognized handler: {other}")),
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Forward => f.write_str("forward"),
            HandlerKind::Dispatch => f.write_str("dispatch"),
        }
    }
}

/// ConfigOverrides はコマンドライン引数による上書き。
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub workers: Option<usize>,
    pub handler: Option<HandlerKind>,
    pub in_memory: bool,
}

/// RuntimeSettings は検証済みの実行時設定。起動時に 1 度だけ構築される。
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub app_name: String,
    pub environment: String,
    pub log: LogConfig,
    pub brokers: Vec<String>,
    pub version: KafkaVersion,
    pub group: String,
    pub topics: Vec<String>,
    pub assignor: AssignorStrategy,
    pub initial_offset: InitialOffset,
    pub workers: usize,
    pub handoff_capacity: usize,
    pub handler: HandlerKind,
    pub shutdown_timeout: Option<Duration>,
    pub retry: RetryConfig,
    pub in_memory: bool,
}

/// base YAML Value に overlay YAML Value を再帰的にマージする。
pub fn merge_yaml(base: &mut serde_yaml::Value, overlay: &serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                if let Some(base_value) = base_map.get_mut(key) {
                    merge_yaml(base_value, value);
                } else {
                    base_map.insert(key.clone(), value.clone());
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

fn read_yaml(path: &str) -> Result<serde_yaml::Value, ConfigError> {
    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_string(),
        source,
    })?;
    let value: serde_yaml::Value = serde_yaml::from_str(&data)?;
    // 空ファイルは空のマッピングとして扱う
    Ok(match value {
        serde_yaml::Value::Null => serde_yaml::Value::Mapping(serde_yaml::Mapping::new()),
        other => other,
    })
}

/// 設定ファイルを読み込む。
///
/// `base_path` が指定された場合はファイルが存在しなければエラーとする。未指定の場合は
/// [`DEFAULT_CONFIG_PATH`] を試し、存在しなければ既定値を使用する。
pub fn load(base_path: Option<&str>, env_path: Option<&str>) -> Result<Config, ConfigError> {
    let mut value = match base_path {
        Some(path) => read_yaml(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => read_yaml(DEFAULT_CONFIG_PATH)?,
        None => {
            tracing::info!(path = DEFAULT_CONFIG_PATH, "config file not found, using defaults");
            serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
        }
    };

    if let Some(env) = env_path {
        let overlay = read_yaml(env)?;
        merge_yaml(&mut value, &overlay);
    }

    Ok(serde_yaml::from_value(value)?)
}

/// 環境変数による上書きを適用する。`lookup` は環境変数名から値を返す。
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let split = |v: &str| -> Vec<String> {
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    };

    if let Some(v) = lookup("KAFKA_BROKERS") {
        config.kafka.brokers = split(&v);
    }
    if let Some(v) = lookup("KAFKA_VERSION") {
        config.kafka.version = v;
    }
    if let Some(v) = lookup("KAFKA_CONSUMER_GROUP") {
        config.kafka.consumer_group = v;
    }
    if let Some(v) = lookup("KAFKA_TOPICS") {
        config.kafka.topics = split(&v);
    }
    if let Some(v) = lookup("KAFKA_ASSIGNOR") {
        config.kafka.assignor = v;
    }
    if let Some(v) = lookup("KAFKA_INITIAL_OFFSET") {
        config.kafka.initial_offset = v;
    }
    if let Some(v) = lookup("CONSUMER_WORKERS") {
        config.consumer.workers = v.trim().parse().map_err(|_| {
            ConfigError::Validation(format!("CONSUMER_WORKERS must be a positive integer, got {v:?}"))
        })?;
    }
    Ok(())
}

impl Config {
    /// コマンドライン引数による上書きを適用する。
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(workers) = overrides.workers {
            self.consumer.workers = workers;
        }
        if let Some(handler) = overrides.handler {
            self.consumer.handler = handler.to_string();
        }
    }

    /// 設定値を検証して RuntimeSettings を構築する。
    pub fn validate(self, in_memory: bool) -> Result<RuntimeSettings, ConfigError> {
        let Config {
            app,
            log,
            kafka,
            consumer,
        } = self;

        if kafka.brokers.is_empty() || kafka.brokers.iter().any(|b| b.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "kafka.brokers must contain at least one non-empty address".into(),
            ));
        }
        let version: KafkaVersion = kafka.version.parse().map_err(ConfigError::Validation)?;
        if kafka.consumer_group.trim().is_empty() {
            return Err(ConfigError::Validation("kafka.consumer_group is required".into()));
        }
        if kafka.topics.is_empty() || kafka.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "kafka.topics must contain at least one topic".into(),
            ));
        }
        let assignor: AssignorStrategy = kafka.assignor.parse().map_err(ConfigError::Validation)?;
        let initial_offset: InitialOffset =
            kafka.initial_offset.parse().map_err(ConfigError::Validation)?;
        if consumer.workers == 0 {
            return Err(ConfigError::Validation("consumer.workers must be >= 1".into()));
        }
        if consumer.handoff_capacity == 0 {
            return Err(ConfigError::Validation(
                "consumer.handoff_capacity must be >= 1".into(),
            ));
        }
        let handler: HandlerKind = consumer.handler.parse().map_err(ConfigError::Validation)?;
        if !["json", "text"].contains(&log.format.as_str()) {
            return Err(ConfigError::Validation("log.format must be json or text".into()));
        }
        if consumer.retry.multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "consumer.retry.multiplier must be >= 1.0".into(),
            ));
        }
        if consumer.retry.max_delay_ms < consumer.retry.initial_delay_ms {
            return Err(ConfigError::Validation(
                "consumer.retry.max_delay_ms must be >= initial_delay_ms".into(),
            ));
        }

        let retry = RetryConfig::default()
            .with_initial_delay(Duration::from_millis(consumer.retry.initial_delay_ms))
            .with_max_delay(Duration::from_millis(consumer.retry.max_delay_ms))
            .with_multiplier(consumer.retry.multiplier)
            .with_jitter(consumer.retry.jitter);

        Ok(RuntimeSettings {
            app_name: app.name,
            environment: app.environment,
            log,
            brokers: kafka.brokers,
            version,
            group: kafka.consumer_group,
            topics: kafka.topics,
            assignor,
            initial_offset,
            workers: consumer.workers,
            handoff_capacity: consumer.handoff_capacity,
            handler,
            shutdown_timeout: consumer.shutdown_timeout_secs.map(Duration::from_secs),
            retry,
            in_memory,
        })
    }
}
