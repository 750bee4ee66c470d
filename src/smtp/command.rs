/// SMTP commands according to RFC 5321

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    /// HELO <domain>
    Helo(String),
    /// EHLO <domain>
    Ehlo(String),
    /// MAIL FROM:<reverse-path> [SP <mail-parameters>]
    MailFrom {
        address: String,
        parameters: Vec<String>,
    },
    /// RCPT TO:<forward-path> [SP <rcpt-parameters>]
    RcptTo {
        address: String,
        parameters: Vec<String>,
    },
    /// DATA
    Data,
    /// RSET
    Rset,
    /// STARTTLS
    StartTls,
    /// AUTH — always rejected, the relay is unauthenticated by design
    Auth,
    /// VRFY <string>
    Vrfy(String),
    /// EXPN <string>
    Expn(String),
    /// HELP [<string>]
    Help,
    /// NOOP [<string>]
    Noop,
    /// QUIT
    Quit,
    /// Unknown command
    Unknown(String),
}

/// Parse an SMTP command from a line of input
pub fn parse_command(input: &str) -> SmtpCommand {
    let input = input.trim_end_matches(|c| c == '\r' || c == '\n');

    let (cmd, args) = match input.find(' ') {
        Some(pos) => (&input[..pos], input[pos + 1..].trim()),
        None => (input, ""),
    };

    match cmd.to_uppercase().as_str() {
        "HELO" => {
            if args.is_empty() {
                SmtpCommand::Unknown(input.to_string())
            } else {
                SmtpCommand::Helo(args.to_string())
            }
        }
        "EHLO" => {
            if args.is_empty() {
                SmtpCommand::Unknown(input.to_string())
            } else {
                SmtpCommand::Ehlo(args.to_string())
            }
        }
        "MAIL" => parse_mail_from(args),
        "RCPT" => parse_rcpt_to(args),
        "DATA" => SmtpCommand::Data,
        "RSET" => SmtpCommand::Rset,
        "STARTTLS" => SmtpCommand::StartTls,
        "AUTH" => SmtpCommand::Auth,
        "VRFY" => SmtpCommand::Vrfy(args.to_string()),
        "EXPN" => SmtpCommand::Expn(args.to_string()),
        "HELP" => SmtpCommand::Help,
        "NOOP" => SmtpCommand::Noop,
        "QUIT" => SmtpCommand::Quit,
        _ => SmtpCommand::Unknown(input.to_string()),
    }
}

/// Parse MAIL FROM command
fn parse_mail_from(args: &str) -> SmtpCommand {
    // Expected format: FROM:<address> [parameters]
    if !args.to_uppercase().starts_with("FROM:") {
        return SmtpCommand::Unknown(format!("MAIL {}", args));
    }

    match parse_address_and_params(&args[5..]) {
        Some((address, parameters)) => SmtpCommand::MailFrom { address, parameters },
        None => SmtpCommand::Unknown(format!("MAIL {}", args)),
    }
}

/// Parse RCPT TO command
fn parse_rcpt_to(args: &str) -> SmtpCommand {
    // Expected format: TO:<address> [parameters]
    if !args.to_uppercase().starts_with("TO:") {
        return SmtpCommand::Unknown(format!("RCPT {}", args));
    }

    match parse_address_and_params(&args[3..]) {
        Some((address, parameters)) => SmtpCommand::RcptTo { address, parameters },
        None => SmtpCommand::Unknown(format!("RCPT {}", args)),
    }
}

/// Parse an address in angle brackets and any following parameters
fn parse_address_and_params(input: &str) -> Option<(String, Vec<String>)> {
    let input = input.trim();

    if !input.starts_with('<') {
        return None;
    }

    let end_bracket = input.find('>')?;
    let address = input[1..end_bracket].to_string();

    let rest = input[end_bracket + 1..].trim();
    let parameters: Vec<String> = if rest.is_empty() {
        Vec::new()
    } else {
        rest.split_whitespace().map(|s| s.to_string()).collect()
    };

    Some((address, parameters))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_helo() {
        assert_eq!(
            parse_command("HELO example.com\r\n"),
            SmtpCommand::Helo("example.com".to_string())
        );
    }

    #[test]
    fn test_parse_ehlo() {
        assert_eq!(
            parse_command("EHLO mail.example.org"),
            SmtpCommand::Ehlo("mail.example.org".to_string())
        );
    }

    #[test]
    fn test_parse_mail_from() {
        assert_eq!(
            parse_command("MAIL FROM:<sender@example.com>"),
            SmtpCommand::MailFrom {
                address: "sender@example.com".to_string(),
                parameters: vec![],
            }
        );
    }

    #[test]
    fn test_parse_mail_from_with_params() {
        assert_eq!(
            parse_command("MAIL FROM:<sender@example.com> SIZE=1024"),
            SmtpCommand::MailFrom {
                address: "sender@example.com".to_string(),
                parameters: vec!["SIZE=1024".to_string()],
            }
        );
    }

    #[test]
    fn test_parse_null_sender() {
        assert_eq!(
            parse_command("MAIL FROM:<>"),
            SmtpCommand::MailFrom { address: String::new(), parameters: vec![] }
        );
    }

    #[test]
    fn test_parse_rcpt_to() {
        assert_eq!(
            parse_command("RCPT TO:<recipient@example.com>"),
            SmtpCommand::RcptTo {
                address: "recipient@example.com".to_string(),
                parameters: vec![],
            }
        );
    }

    #[test]
    fn test_parse_auth_always_auth() {
        assert_eq!(parse_command("AUTH PLAIN dGVzdA=="), SmtpCommand::Auth);
        assert_eq!(parse_command("AUTH LOGIN"), SmtpCommand::Auth);
    }

    #[test]
    fn test_parse_data_and_quit() {
        assert_eq!(parse_command("DATA\r\n"), SmtpCommand::Data);
        assert_eq!(parse_command("QUIT"), SmtpCommand::Quit);
    }

    #[test]
    fn test_parse_unknown() {
        match parse_command("INVALID") {
            SmtpCommand::Unknown(_) => (),
            _ => panic!("Expected Unknown command"),
        }
    }
}
