//! Parsing helpers for the relay's message payload and the phone-book
//! conventions layered on top of it.

pub const NAME_REQUEST_PREFIX: &str = "%REQ";

/// How long a name request stays answerable.
pub const NAME_REQUEST_WINDOW_SECS: u32 = 86_400;

/// Media marker the relay sends for unsupported attachment formats.
pub const UNSUPPORTED_MEDIA: &str = "NS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageParseError {
    #[error("payload is missing the `{0}` field")]
    MissingField(&'static str),
}

/// One inbound SMS/MMS as published by the relay:
/// `id:<sid>\nfrom:<number>\nbody:<text>\nmedia:<files|0>\ntime:<unix>`.
/// The body is bounded by the field markers, so it may span lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: String,
    pub from: String,
    pub body: String,
    pub media: Vec<String>,
    pub unix_time: u32,
}

impl InboundMessage {
    pub fn parse(payload: &str) -> Result<Self, MessageParseError> {
        let id = between(payload, "id:", "\nfrom:")
            .ok_or(MessageParseError::MissingField("from"))?;
        let from = between(payload, "from:", "\nbody:")
            .ok_or(MessageParseError::MissingField("body"))?;
        let body = between(payload, "body:", "\nmedia:")
            .ok_or(MessageParseError::MissingField("media"))?;
        let media_field = between(payload, "media:", "\ntime:")
            .ok_or(MessageParseError::MissingField("time"))?;
        let time_field = payload
            .find("time:")
            .map(|at| &payload[at + "time:".len()..])
            .ok_or(MessageParseError::MissingField("time"))?;

        let media = if media_field == "0" || media_field.is_empty() {
            Vec::new()
        } else {
            media_field.split(',').map(str::to_string).collect()
        };

        Ok(Self {
            id: id.to_string(),
            from: from.to_string(),
            body: body.to_string(),
            media,
            unix_time: time_field.trim().parse().unwrap_or(0),
        })
    }
}

/// Dot-commands a sender can text to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCommand {
    Help,
    Name,
    Photo,
}

impl MessageCommand {
    pub fn from_body(body: &str) -> Option<Self> {
        match body {
            ".help" => Some(Self::Help),
            ".name" => Some(Self::Name),
            ".photo" => Some(Self::Photo),
            _ => None,
        }
    }
}

/// North-American display form for a bare 11-digit number starting with 1:
/// `16043739569` becomes `(604) 373 - 9569`. Anything else is returned
/// unchanged.
pub fn format_phone_number(number: &str) -> String {
    if number.len() == 11 && number.starts_with('1') && number.chars().all(|c| c.is_ascii_digit())
    {
        format!(
            "({}) {} - {}",
            &number[1..4],
            &number[4..7],
            &number[7..11]
        )
    } else {
        number.to_string()
    }
}

/// Phone-book value recorded when the machine asks a sender for their name.
pub fn name_request(unix_time: u32) -> String {
    format!("{NAME_REQUEST_PREFIX}{unix_time}")
}

/// The send time inside a `%REQ<unix>` phone-book entry, if it is one.
pub fn name_request_sent_at(entry: &str) -> Option<u32> {
    entry
        .strip_prefix(NAME_REQUEST_PREFIX)
        .and_then(|rest| rest.parse().ok())
}

/// A name request is answerable for 24 hours after it was sent.
pub fn name_request_expired(entry: &str, now_unix: u32) -> bool {
    match name_request_sent_at(entry) {
        Some(sent_at) => now_unix > sent_at.saturating_add(NAME_REQUEST_WINDOW_SECS),
        None => false,
    }
}

fn between<'a>(payload: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = payload.find(start)? + start.len();
    let to = payload.find(end)?;
    payload.get(from..to)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const PAYLOAD: &str =
        "id:SM123\nfrom:16043739569\nbody:Hello from the bridge\nmedia:0\ntime:1546300800";

    #[test]
    fn parses_a_plain_text_message() {
        let message = InboundMessage::parse(PAYLOAD).unwrap();

        assert_eq!(message.id, "SM123");
        assert_eq!(message.from, "16043739569");
        assert_eq!(message.body, "Hello from the bridge");
        assert!(message.media.is_empty());
        assert_eq!(message.unix_time, 1_546_300_800);
    }

    #[test]
    fn parses_a_multi_line_body() {
        let payload = "id:SM9\nfrom:15551234567\nbody:line one\nline two\nmedia:0\ntime:42";
        let message = InboundMessage::parse(payload).unwrap();

        assert_eq!(message.body, "line one\nline two");
    }

    #[test]
    fn parses_a_media_list() {
        let payload = "id:SM5\nfrom:15551234567\nbody:\nmedia:abc123,def456,NS\ntime:42";
        let message = InboundMessage::parse(payload).unwrap();

        assert_eq!(message.body, "");
        assert_eq!(message.media, vec!["abc123", "def456", "NS"]);
        assert_eq!(message.media[2], UNSUPPORTED_MEDIA);
    }

    #[test]
    fn malformed_payload_reports_the_missing_field() {
        let err = InboundMessage::parse("id:SM1\nfrom:123").unwrap_err();
        assert_eq!(err, MessageParseError::MissingField("body"));
    }

    #[test]
    fn unparsable_time_defaults_to_zero() {
        let payload = "id:SM5\nfrom:1\nbody:hi\nmedia:0\ntime:later";
        assert_eq!(InboundMessage::parse(payload).unwrap().unix_time, 0);
    }

    #[test]
    fn recognizes_dot_commands() {
        assert_eq!(MessageCommand::from_body(".help"), Some(MessageCommand::Help));
        assert_eq!(MessageCommand::from_body(".name"), Some(MessageCommand::Name));
        assert_eq!(MessageCommand::from_body(".photo"), Some(MessageCommand::Photo));
        assert_eq!(MessageCommand::from_body(".helpme"), None);
        assert_eq!(MessageCommand::from_body("help"), None);
    }

    #[test]
    fn formats_north_american_numbers() {
        assert_eq!(format_phone_number("16043739569"), "(604) 373 - 9569");
        // Non-NANP and already-named senders pass through untouched.
        assert_eq!(format_phone_number("447700900123"), "447700900123");
        assert_eq!(format_phone_number("Silviu"), "Silviu");
    }

    #[test]
    fn name_requests_expire_after_a_day() {
        let entry = name_request(1_000_000);
        assert_eq!(entry, "%REQ1000000");
        assert_eq!(name_request_sent_at(&entry), Some(1_000_000));

        assert!(!name_request_expired(&entry, 1_000_000 + 86_400));
        assert!(name_request_expired(&entry, 1_000_000 + 86_401));
        // A real name is never "expired".
        assert!(!name_request_expired("Silviu", u32::MAX));
    }
}
