/**
 * TOPIC DISPATCHER - Aiguillage topic MQTT → famille de message
 *
 * RÔLE : Associe chaque topic entrant à un normaliseur via des règles de
 * filtres MQTT (`+` un niveau, `#` fin de topic).
 *
 * PRIORITÉ : règles littérales d'abord, puis règles à jokers dans l'ordre de
 * configuration. Un topic sans règle n'est pas une erreur, juste un signal.
 */

use crate::config::InboundTopics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFamily {
    Position,
    HealthEnvelope,
    HeartRate,
    Temperature,
    Diaper,
    Alert,
}

impl MessageFamily {
    /// Familles dont l'identifiant patient est le dernier segment du topic
    fn carries_trailing_id(&self) -> bool {
        matches!(
            self,
            MessageFamily::HeartRate
                | MessageFamily::Temperature
                | MessageFamily::Diaper
                | MessageFamily::Alert
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub family: MessageFamily,
    pub trailing_id: Option<String>,
}

#[derive(Debug, Clone)]
struct Rule {
    filter: String,
    family: MessageFamily,
}

impl Rule {
    fn is_literal(&self) -> bool {
        !self.filter.contains(['+', '#'])
    }
}

#[derive(Debug, Clone)]
pub struct TopicDispatcher {
    rules: Vec<Rule>,
}

impl TopicDispatcher {
    pub fn new(topics: &InboundTopics) -> Self {
        let declared = vec![
            Rule { filter: topics.positioning.clone(), family: MessageFamily::Position },
            Rule { filter: topics.heart_rate.clone(), family: MessageFamily::HeartRate },
            Rule { filter: topics.temperature.clone(), family: MessageFamily::Temperature },
            Rule { filter: topics.diaper.clone(), family: MessageFamily::Diaper },
            Rule { filter: topics.alert.clone(), family: MessageFamily::Alert },
            Rule { filter: topics.health_envelope.clone(), family: MessageFamily::HealthEnvelope },
        ];
        // tri stable : l'ordre de déclaration est conservé parmi les jokers
        let (mut rules, wildcards): (Vec<Rule>, Vec<Rule>) =
            declared.into_iter().partition(Rule::is_literal);
        rules.extend(wildcards);
        Self { rules }
    }

    pub fn route(&self, topic: &str) -> Option<Route> {
        let rule = self.rules.iter().find(|r| topic_matches(&r.filter, topic))?;
        let trailing_id = if rule.family.carries_trailing_id() {
            let id = last_segment(topic);
            if id.is_empty() {
                return None;
            }
            Some(id.to_string())
        } else {
            None
        };
        Some(Route { family: rule.family, trailing_id })
    }
}

/// Dernier segment d'un topic
/// Ex: "health/heartrate/patient_7" -> "patient_7"
pub fn last_segment(topic: &str) -> &str {
    topic.rsplit('/').next().unwrap_or(topic)
}

/// Correspondance filtre MQTT / topic concret
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> TopicDispatcher {
        TopicDispatcher::new(&InboundTopics::default())
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("gateway/+/health", "gateway/gw-3/health"));
        assert!(!topic_matches("gateway/+/health", "gateway/gw-3/health/extra"));
        assert!(topic_matches("health/#", "health/diaper/p1"));
        assert!(topic_matches("uwb/site-01/positions", "uwb/site-01/positions"));
        assert!(!topic_matches("uwb/site-01/positions", "uwb/site-02/positions"));
        assert!(!topic_matches("health/heartrate/+", "health/heartrate"));
    }

    #[test]
    fn literal_rule_wins_over_wildcards() {
        let topics = InboundTopics {
            positioning: "health/heartrate/positions".into(),
            ..InboundTopics::default()
        };
        let d = TopicDispatcher::new(&topics);
        let route = d.route("health/heartrate/positions").unwrap();
        assert_eq!(route.family, MessageFamily::Position);
        assert_eq!(route.trailing_id, None);
    }

    #[test]
    fn per_family_topics_carry_the_trailing_id() {
        let d = dispatcher();
        let route = d.route("health/heartrate/patient_7").unwrap();
        assert_eq!(route.family, MessageFamily::HeartRate);
        assert_eq!(route.trailing_id.as_deref(), Some("patient_7"));

        assert_eq!(d.route("health/temperature/p2").unwrap().family, MessageFamily::Temperature);
        assert_eq!(d.route("health/diaper/p3").unwrap().family, MessageFamily::Diaper);
        assert_eq!(d.route("health/alert/p4").unwrap().family, MessageFamily::Alert);
    }

    #[test]
    fn envelope_and_positions() {
        let d = dispatcher();
        let env = d.route("gateway/gw-01/health").unwrap();
        assert_eq!(env.family, MessageFamily::HealthEnvelope);
        assert_eq!(env.trailing_id, None);
        assert_eq!(d.route("uwb/site-01/positions").unwrap().family, MessageFamily::Position);
    }

    #[test]
    fn unknown_topics_are_not_routed() {
        let d = dispatcher();
        assert_eq!(d.route("random/topic"), None);
        assert_eq!(d.route("health/heartrate/"), None);
    }

    #[test]
    fn test_last_segment() {
        assert_eq!(last_segment("a/b/c"), "c");
        assert_eq!(last_segment("single"), "single");
    }
}
