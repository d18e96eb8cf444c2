//! 邮件模板
//!
//! 欢迎邮件使用固定模板，只替换收件人称呼。纯文本、UTF-8，行尾使用 CRLF。

/// 欢迎邮件主题
pub const WELCOME_SUBJECT: &str = "Welcome to the Shop!";

/// 渲染后的邮件内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

/// 渲染欢迎邮件
pub fn render_welcome(name: &str) -> RenderedEmail {
    let mut body = String::with_capacity(256);
    body.push_str(&format!("Hi {name},\r\n\r\n"));
    body.push_str("Thanks for creating an account with us! We're excited to have you on board.\r\n");
    body.push_str(
        "If you have any questions, just reply to this email and we'll be glad to help.\r\n\r\n",
    );
    body.push_str("Cheers,\r\nThe Shop Team\r\n");

    RenderedEmail {
        subject: WELCOME_SUBJECT.to_string(),
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_welcome() {
        let email = render_welcome("alice");

        assert_eq!(email.subject, "Welcome to the Shop!");
        assert!(email.body.starts_with("Hi alice,\r\n\r\n"));
        assert!(email.body.contains("Thanks for creating an account with us!"));
        assert!(email.body.ends_with("Cheers,\r\nThe Shop Team\r\n"));
    }

    #[test]
    fn test_render_keeps_unicode_name() {
        let email = render_welcome("小明");
        assert!(email.body.starts_with("Hi 小明,"));
    }
}
