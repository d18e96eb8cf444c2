//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::error::ShopError;

/// Kafka 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// 逗号分隔的 broker 地址列表
    pub brokers: String,
    pub consumer_group: String,
    pub auto_offset_reset: String,
    /// 用户创建事件所在的 topic
    pub user_created_topic: String,
    /// 处理失败消息的死信 topic
    pub dead_letter_topic: String,
    /// 自动声明 topic 时使用的分区数
    pub topic_partitions: i32,
    pub replication_factor: i32,
    pub message_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:19092".to_string(),
            consumer_group: "email-service".to_string(),
            auto_offset_reset: "earliest".to_string(),
            user_created_topic: "user_created".to_string(),
            dead_letter_topic: "user_created.dlq".to_string(),
            topic_partitions: 3,
            replication_factor: 1,
            message_timeout_ms: 5000,
        }
    }
}

impl KafkaConfig {
    /// 拆分后的 broker 列表，忽略空白项
    pub fn broker_list(&self) -> Vec<&str> {
        self.brokers
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .collect()
    }
}

/// 处理失败时的位点提交策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicyKind {
    /// 记录日志后直接提交
    Commit,
    /// 对可重试错误退避重试，耗尽后提交
    Retry,
    /// 重试耗尽后写入死信 topic 再提交
    DeadLetter,
}

/// 消费工作池配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 并发 worker 数，必须 >= 1
    pub count: usize,
    /// 拉取循环与 worker 之间的交接队列容量
    pub queue_capacity: usize,
    pub failure_policy: FailurePolicyKind,
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            queue_capacity: 1,
            failure_policy: FailurePolicyKind::Commit,
            max_retries: 3,
            initial_retry_delay_ms: 500,
            max_retry_delay_ms: 10_000,
        }
    }
}

/// 邮件发送配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    /// 是否使用隐式 TLS 连接
    pub use_tls: bool,
    pub from_address: String,
    pub from_name: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            smtp_host: String::new(),
            smtp_port: 587,
            username: String::new(),
            password: String::new(),
            use_tls: true,
            from_address: "welcome@example.com".to_string(),
            from_name: "Shop Team".to_string(),
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_port: 9090,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub kafka: KafkaConfig,
    pub worker: WorkerConfig,
    pub mail: MailConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. .env 文件（若存在，仅注入进程环境变量）
    /// 2. config/default.toml（默认配置）
    /// 3. config/{environment}.toml（环境特定配置）
    /// 4. config/{service_name}.toml（服务特定配置）
    /// 5. 环境变量（SHOP_ 前缀，层级用双下划线，如 SHOP_KAFKA__BROKERS -> kafka.brokers）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let env = std::env::var("SHOP_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("SHOP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 校验消费管道运行所需的配置
    ///
    /// 邮件配置只在消费端需要，因此单独由 `validate_mail` 校验。
    pub fn validate(&self) -> Result<(), ShopError> {
        if self.kafka.broker_list().is_empty() {
            return Err(ShopError::Config("kafka.brokers 不能为空".to_string()));
        }
        if self.kafka.user_created_topic.trim().is_empty() {
            return Err(ShopError::Config(
                "kafka.user_created_topic 不能为空".to_string(),
            ));
        }
        if self.kafka.consumer_group.trim().is_empty() {
            return Err(ShopError::Config("kafka.consumer_group 不能为空".to_string()));
        }
        if self.worker.count == 0 {
            return Err(ShopError::Config("worker.count 必须大于 0".to_string()));
        }
        if self.worker.queue_capacity == 0 {
            return Err(ShopError::Config(
                "worker.queue_capacity 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }

    /// 校验邮件发送配置
    pub fn validate_mail(&self) -> Result<(), ShopError> {
        if self.mail.smtp_host.trim().is_empty() {
            return Err(ShopError::Config("mail.smtp_host 不能为空".to_string()));
        }
        if self.mail.from_address.trim().is_empty() {
            return Err(ShopError::Config("mail.from_address 不能为空".to_string()));
        }
        Ok(())
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
