//! 邮件发送
//!
//! `Mailer` 是 handler 与邮件传输之间的唯一边界：给定收件地址与称呼，
//! 发送欢迎邮件并报告成功或失败。SMTP 只是其中一种实现。

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use shop_shared::config::MailConfig;
use tracing::info;

use crate::error::EmailError;
use crate::templates;

/// 欢迎邮件发送接缝
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_welcome(&self, to: &str, name: &str) -> Result<(), EmailError>;
}

/// 基于 lettre 的 SMTP 发送器
///
/// `use_tls` 为 true 时使用隐式 TLS 连接；否则明文连接（本地 Mailpit 等）。
/// 配置了用户名时才进行认证。
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &MailConfig) -> Result<Self, EmailError> {
        if config.smtp_host.trim().is_empty() {
            return Err(EmailError::InvalidConfig("smtp_host 未配置".to_string()));
        }

        let mut builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
                .map_err(|e| EmailError::InvalidConfig(format!("创建 SMTP TLS 连接失败: {e}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };
        builder = builder.port(config.smtp_port);

        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        let from = mailbox(&config.from_name, &config.from_address)?;

        info!(
            host = %config.smtp_host,
            port = config.smtp_port,
            tls = config.use_tls,
            "SMTP 发送器已初始化"
        );

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    fn build_welcome(&self, to: &str, name: &str) -> Result<Message, EmailError> {
        let rendered = templates::render_welcome(name);

        Message::builder()
            .from(self.from.clone())
            .to(mailbox(name, to)?)
            .subject(rendered.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(rendered.body)
            .map_err(|e| EmailError::Transport {
                to: to.to_string(),
                reason: format!("构建邮件失败: {e}"),
            })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_welcome(&self, to: &str, name: &str) -> Result<(), EmailError> {
        let message = self.build_welcome(to, name)?;

        self.transport
            .send(message)
            .await
            .map_err(|e| EmailError::Transport {
                to: to.to_string(),
                reason: e.to_string(),
            })?;

        info!(to = %to, name = %name, "欢迎邮件已通过 SMTP 发送");
        Ok(())
    }
}

fn mailbox(name: &str, address: &str) -> Result<Mailbox, EmailError> {
    let address: Address = address
        .trim()
        .parse()
        .map_err(|_| EmailError::InvalidAddress(address.to_string()))?;
    let name = (!name.trim().is_empty()).then(|| name.to_string());
    Ok(Mailbox::new(name, address))
}
