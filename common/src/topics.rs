/// Inbound SMS/MMS for a given relay phone number.
pub fn message_topic(phone_number: &str) -> String {
    format!("smsin-{phone_number}")
}

pub const TOPIC_MACHINE_STATE: &str = "tagmachine/state";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_topic_embeds_the_phone_number() {
        assert_eq!(message_topic("16043739569"), "smsin-16043739569");
    }
}
