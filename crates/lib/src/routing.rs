//! Rule-based dispatch: every configured rule is evaluated against every complete
//! message; matching rules render text and submit jobs to channels by name.

use crate::channels::{ChannelHandle, ChannelKind, ChannelRegistry, CompleteMessage, OutboundJob};
use crate::config::RuleConfig;
use regex::Regex;
use std::sync::{Arc, LazyLock};

static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+\d{6,15}$").expect("valid regex"));
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").expect("valid regex")
});

/// Template marker selecting the envelope rendering.
const ENVELOPE_MARKER: &str = "encap";

/// `+` followed by 6 to 15 digits.
pub fn is_valid_phone(destination: &str) -> bool {
    PHONE_RE.is_match(destination)
}

/// ASCII `local@domain.tld`.
pub fn is_valid_email(destination: &str) -> bool {
    EMAIL_RE.is_match(destination)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    Reply,
    Forward,
    /// Anything else; handled as `Reply` with a warning.
    Unknown(String),
}

impl RuleAction {
    fn parse(action: Option<&str>) -> Self {
        match action.map(|a| a.trim().to_lowercase()) {
            None => Self::Reply,
            Some(a) if a.is_empty() || a == "reply" => Self::Reply,
            Some(a) if a == "forward" => Self::Forward,
            Some(a) => Self::Unknown(a),
        }
    }
}

/// Reasons a single rule effect is skipped. Logged, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("channel {0} not found")]
    UnknownChannel(String),
    #[error("channel {0} is not a modem, cannot reply")]
    NotModem(String),
    #[error("invalid destination {destination} for {kind} channel {channel}")]
    InvalidDestination {
        channel: String,
        kind: ChannelKind,
        destination: String,
    },
    #[error("no target channels for forward")]
    NoTargets,
    #[error("channel {0} is shutting down, job dropped")]
    ChannelClosed(String),
}

/// A routing rule, built once from config.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    senders: Vec<String>,
    /// Lowercased substrings.
    content: Vec<String>,
    template: Option<String>,
    pub action: RuleAction,
    targets: Option<Vec<String>>,
    destinations: Option<Vec<String>>,
}

impl From<&RuleConfig> for Rule {
    fn from(config: &RuleConfig) -> Self {
        Self {
            name: config.name.clone(),
            senders: config.sender.clone(),
            content: config.content.iter().map(|c| c.to_lowercase()).collect(),
            template: config.message.clone().filter(|m| !m.is_empty()),
            action: RuleAction::parse(config.action.as_deref()),
            targets: config.queue.clone(),
            destinations: config.destination.clone(),
        }
    }
}

impl Rule {
    /// Sender filter (exact) and content filter (any substring, case-insensitive).
    pub fn matches(&self, msg: &CompleteMessage) -> bool {
        if !self.senders.is_empty() && !self.senders.iter().any(|s| *s == msg.sender) {
            return false;
        }
        if !self.content.is_empty() {
            let text = msg.text.to_lowercase();
            if !self.content.iter().any(|c| text.contains(c.as_str())) {
                return false;
            }
        }
        true
    }

    /// Text sent by this rule: the template, the message text when there is no template,
    /// or the envelope when the template carries the marker.
    pub fn render(&self, msg: &CompleteMessage) -> String {
        let Some(template) = &self.template else {
            return msg.text.clone();
        };
        if !template.to_lowercase().contains(ENVELOPE_MARKER) {
            return template.clone();
        }
        let mut out = format!(
            "Sender: {}@{}\nTime: {}\nMessage:\n{}",
            msg.sender,
            msg.source_channel,
            msg.timestamp(),
            msg.text
        );
        if let Some(info) = &msg.multipart {
            out.push_str(&format!(
                "\n[Note: Part:{}/{} Reference:{} From:{}]",
                info.part, info.total, info.reference, msg.sender
            ));
        }
        out
    }

    /// Target channel names; the source channel when the rule names none.
    pub fn targets(&self, msg: &CompleteMessage) -> Vec<String> {
        self.targets
            .clone()
            .unwrap_or_else(|| vec![msg.source_channel.clone()])
    }

    /// Forward destinations; defaults to the sender for reply rules, nothing otherwise.
    pub fn destinations(&self, msg: &CompleteMessage) -> Vec<String> {
        match &self.destinations {
            Some(d) => d.clone(),
            None if self.action == RuleAction::Forward => Vec::new(),
            None => vec![msg.sender.clone()],
        }
    }
}

/// Applies the rule list and submits jobs through the channel registry.
pub struct Dispatcher {
    rules: Vec<Rule>,
    channels: Arc<ChannelRegistry>,
}

impl Dispatcher {
    pub fn new(rules: Vec<Rule>, channels: Arc<ChannelRegistry>) -> Self {
        Self { rules, channels }
    }

    pub fn from_config(rules: &[RuleConfig], channels: Arc<ChannelRegistry>) -> Self {
        Self::new(rules.iter().map(Rule::from).collect(), channels)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Evaluate every rule against `msg`. Returns the number of jobs submitted.
    pub async fn apply(&self, msg: &CompleteMessage) -> usize {
        let mut submitted = 0;
        for rule in &self.rules {
            if !rule.matches(msg) {
                continue;
            }
            log::debug!("rule {}: matched message from {}", rule.name, msg.sender);
            let text = rule.render(msg);
            submitted += match &rule.action {
                RuleAction::Forward => self.forward(rule, msg, &text).await,
                RuleAction::Reply => self.reply(rule, msg, &text).await,
                RuleAction::Unknown(action) => {
                    log::warn!(
                        "rule {}: unknown action {}, defaulting to reply",
                        rule.name,
                        action
                    );
                    self.reply(rule, msg, &text).await
                }
            };
        }
        submitted
    }

    async fn reply(&self, rule: &Rule, msg: &CompleteMessage, text: &str) -> usize {
        let mut submitted = 0;
        for target in rule.targets(msg) {
            let result = match self.channels.get(&target).await {
                None => Err(DispatchError::UnknownChannel(target)),
                Some(h) if h.kind != ChannelKind::Modem => Err(DispatchError::NotModem(target)),
                Some(h) => submit(&h, OutboundJob::new(msg.sender.as_str(), text)).await,
            };
            submitted += report(rule, result);
        }
        submitted
    }

    async fn forward(&self, rule: &Rule, msg: &CompleteMessage, text: &str) -> usize {
        let targets = rule.targets(msg);
        if targets.is_empty() {
            return report(rule, Err(DispatchError::NoTargets));
        }
        let destinations = rule.destinations(msg);
        let mut submitted = 0;
        for target in targets {
            let Some(handle) = self.channels.get(&target).await else {
                submitted += report(rule, Err(DispatchError::UnknownChannel(target)));
                continue;
            };
            match handle.kind {
                ChannelKind::Api => {
                    let job = OutboundJob::new(msg.sender.as_str(), text)
                        .with_timestamp(msg.timestamp());
                    submitted += report(rule, submit(&handle, job).await);
                }
                ChannelKind::Email | ChannelKind::Modem => {
                    let valid: fn(&str) -> bool = if handle.kind == ChannelKind::Email {
                        is_valid_email
                    } else {
                        is_valid_phone
                    };
                    for dest in &destinations {
                        let result = if valid(dest) {
                            submit(&handle, OutboundJob::new(dest.as_str(), text)).await
                        } else {
                            Err(DispatchError::InvalidDestination {
                                channel: handle.name.clone(),
                                kind: handle.kind,
                                destination: dest.clone(),
                            })
                        };
                        submitted += report(rule, result);
                    }
                }
            }
        }
        submitted
    }
}

async fn submit(handle: &ChannelHandle, job: OutboundJob) -> Result<String, DispatchError> {
    let destination = job.destination.clone();
    if handle.enqueue(job).await {
        Ok(format!("{} via {}", destination, handle.name))
    } else {
        Err(DispatchError::ChannelClosed(handle.name.clone()))
    }
}

fn report(rule: &Rule, result: Result<String, DispatchError>) -> usize {
    match result {
        Ok(what) => {
            log::info!("rule {}: queued {}", rule.name, what);
            1
        }
        Err(e) => {
            log::warn!("rule {}: {}", rule.name, e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{InboundMessage, JobQueue, MultipartInfo};
    use chrono::{Local, TimeZone};

    fn rule(json: &str) -> Rule {
        let config: RuleConfig = serde_json::from_str(json).unwrap();
        Rule::from(&config)
    }

    fn message(sender: &str, text: &str) -> CompleteMessage {
        let mut msg = CompleteMessage::single(InboundMessage::new("modem1", sender, text));
        msg.received_at = Local.with_ymd_and_hms(2024, 7, 10, 13, 28, 51).unwrap();
        msg
    }

    async fn registry(channels: &[(&str, ChannelKind)]) -> Arc<ChannelRegistry> {
        let registry = Arc::new(ChannelRegistry::new());
        for (name, kind) in channels {
            registry
                .register(ChannelHandle::new(*name, *kind, Arc::new(JobQueue::new())))
                .await;
        }
        registry
    }

    async fn jobs(registry: &ChannelRegistry, name: &str) -> Vec<OutboundJob> {
        registry.get(name).await.unwrap().queue().pending().await
    }

    #[test]
    fn destination_validation() {
        assert!(is_valid_phone("+15551234567"));
        assert!(!is_valid_phone("notaphone"));
        assert!(!is_valid_phone("15551234567"));
        assert!(!is_valid_phone("+12345"));
        assert!(is_valid_email("a@b.co"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("a b@c.com"));
    }

    #[test]
    fn sender_filter_is_exact() {
        let r = rule(r#"{"sender": ["+1555"]}"#);
        assert!(r.matches(&message("+1555", "x")));
        assert!(!r.matches(&message("+1556", "x")));
    }

    #[test]
    fn content_filter_is_case_insensitive_any_match() {
        let r = rule(r#"{"content": ["hello", "status"]}"#);
        assert!(r.matches(&message("+1", "HELLO world")));
        assert!(r.matches(&message("+1", "Status?")));
        assert!(!r.matches(&message("+1", "goodbye")));
    }

    #[test]
    fn render_falls_back_to_message_text() {
        assert_eq!(rule("{}").render(&message("+1", "raw")), "raw");
        assert_eq!(rule(r#"{"message": ""}"#).render(&message("+1", "raw")), "raw");
        assert_eq!(
            rule(r#"{"message": ["Thanks!"]}"#).render(&message("+1", "raw")),
            "Thanks!"
        );
    }

    #[test]
    fn envelope_includes_multipart_note() {
        let mut msg = message("+1555", "Hello");
        let r = rule(r#"{"message": "ENCAP"}"#);
        let expected = format!(
            "Sender: +1555@modem1\nTime: {}\nMessage:\nHello",
            msg.timestamp()
        );
        assert_eq!(r.render(&msg), expected);

        msg.multipart = Some(MultipartInfo {
            reference: 7,
            part: 2,
            total: 2,
            partial: false,
        });
        assert_eq!(
            r.render(&msg),
            format!("{}\n[Note: Part:2/2 Reference:7 From:+1555]", expected)
        );
    }

    #[test]
    fn unknown_action_is_kept_for_reporting() {
        assert_eq!(rule(r#"{"action": "Forward"}"#).action, RuleAction::Forward);
        assert_eq!(
            rule(r#"{"action": "bounce"}"#).action,
            RuleAction::Unknown("bounce".to_string())
        );
        assert_eq!(rule("{}").action, RuleAction::Reply);
    }

    #[tokio::test]
    async fn reply_rule_queues_on_source_modem() {
        let registry = registry(&[("modem1", ChannelKind::Modem)]).await;
        let dispatcher = Dispatcher::new(
            vec![rule(r#"{"sender": ["+1555"], "action": "reply"}"#)],
            registry.clone(),
        );
        assert_eq!(dispatcher.apply(&message("+1555", "STATUS")).await, 1);
        assert_eq!(
            jobs(&registry, "modem1").await,
            vec![OutboundJob::new("+1555", "STATUS")]
        );
        assert_eq!(dispatcher.apply(&message("+1556", "STATUS")).await, 0);
    }

    #[tokio::test]
    async fn reply_skips_non_modem_and_unknown_targets() {
        let registry = registry(&[("mail", ChannelKind::Email)]).await;
        let dispatcher = Dispatcher::new(
            vec![rule(r#"{"queue": ["mail", "ghost"]}"#)],
            registry.clone(),
        );
        assert_eq!(dispatcher.apply(&message("+1555", "x")).await, 0);
        assert!(jobs(&registry, "mail").await.is_empty());
    }

    #[tokio::test]
    async fn forward_validates_destinations_per_channel_kind() {
        let registry = registry(&[("mail", ChannelKind::Email), ("modem2", ChannelKind::Modem)]).await;
        let dispatcher = Dispatcher::new(
            vec![rule(
                r#"{"action": "forward", "queue": ["mail", "modem2"],
                    "destination": ["ops@example.com", "+15551234567", "bogus"]}"#,
            )],
            registry.clone(),
        );
        assert_eq!(dispatcher.apply(&message("+1555", "alert")).await, 2);
        let mail: Vec<String> = jobs(&registry, "mail")
            .await
            .into_iter()
            .map(|j| j.destination)
            .collect();
        let sms: Vec<String> = jobs(&registry, "modem2")
            .await
            .into_iter()
            .map(|j| j.destination)
            .collect();
        assert_eq!(mail, vec!["ops@example.com"]);
        assert_eq!(sms, vec!["+15551234567"]);
    }

    #[tokio::test]
    async fn forward_to_api_carries_envelope_and_timestamp() {
        let registry = registry(&[("hook", ChannelKind::Api)]).await;
        let dispatcher = Dispatcher::new(
            vec![rule(r#"{"message": ["encap"], "action": ["forward"], "queue": ["hook"]}"#)],
            registry.clone(),
        );
        let msg = message("+1555", "hi");
        assert_eq!(dispatcher.apply(&msg).await, 1);
        let queued = jobs(&registry, "hook").await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].destination, "+1555");
        assert!(queued[0].text.starts_with("Sender: +1555@modem1\nTime: "));
        assert!(queued[0].text.ends_with("Message:\nhi"));
        assert_eq!(queued[0].timestamp.as_deref(), Some(msg.timestamp().as_str()));
    }

    #[tokio::test]
    async fn forward_without_targets_is_skipped() {
        let registry = registry(&[("modem1", ChannelKind::Modem)]).await;
        let dispatcher = Dispatcher::new(
            vec![rule(r#"{"action": "forward", "queue": []}"#)],
            registry.clone(),
        );
        assert_eq!(dispatcher.apply(&message("+1555", "x")).await, 0);
    }

    #[tokio::test]
    async fn every_matching_rule_fires() {
        let registry = registry(&[("modem1", ChannelKind::Modem), ("hook", ChannelKind::Api)]).await;
        let dispatcher = Dispatcher::from_config(
            &serde_json::from_str::<Vec<RuleConfig>>(
                r#"[
                    {"name": "ack", "action": "reply", "message": "ok"},
                    {"name": "audit", "action": "forward", "queue": ["hook"]},
                    {"name": "odd", "action": "bounce", "content": ["nomatch"]}
                ]"#,
            )
            .unwrap(),
            registry.clone(),
        );
        assert_eq!(dispatcher.apply(&message("+1555", "x")).await, 2);
        assert_eq!(jobs(&registry, "modem1").await[0].text, "ok");
        assert_eq!(jobs(&registry, "hook").await[0].text, "x");
    }

    #[tokio::test]
    async fn closed_channel_refuses_jobs() {
        let registry = registry(&[("modem1", ChannelKind::Modem)]).await;
        registry.close_all().await;
        let dispatcher = Dispatcher::new(vec![rule("{}")], registry);
        assert_eq!(dispatcher.apply(&message("+1555", "x")).await, 0);
    }
}
