//! Usage reporting aggregated from audit entries.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::audit::actions;
use crate::db::models::{LogCategory, LogEntry, LogLevel};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelUsage {
    pub model: String,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub conversations: usize,
    pub messages: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackStats {
    pub helpful: usize,
    pub not_helpful: usize,
    pub helpful_percentage: f64,
    /// Reasons given for negative feedback, with counts.
    pub reasons: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub total_entries: usize,
    pub model_usage: Vec<ModelUsage>,
    pub daily_usage: Vec<DailyUsage>,
    pub feedback: FeedbackStats,
    pub by_category: HashMap<LogCategory, usize>,
    pub by_level: HashMap<LogLevel, usize>,
}

impl UsageReport {
    pub fn from_entries(entries: &[LogEntry]) -> Self {
        let mut models: HashMap<String, usize> = HashMap::new();
        let mut daily: BTreeMap<NaiveDate, DailyUsage> = BTreeMap::new();
        let mut votes: Vec<&LogEntry> = Vec::new();
        let mut vote_index: HashMap<&str, usize> = HashMap::new();
        let mut by_category = HashMap::new();
        let mut by_level = HashMap::new();

        for entry in entries {
            *by_category.entry(entry.category).or_insert(0) += 1;
            *by_level.entry(entry.level).or_insert(0) += 1;

            let date = entry.timestamp.date_naive();
            let day = || DailyUsage {
                date,
                conversations: 0,
                messages: 0,
            };

            match entry.action.as_str() {
                actions::MESSAGE_SENT | actions::RESPONSE_REGENERATED => {
                    let model = detail_str(entry, "model").unwrap_or("unknown");
                    *models.entry(model.to_string()).or_insert(0) += 1;
                    daily.entry(date).or_insert_with(day).messages += 1;
                }
                actions::CONVERSATION_SAVED => {
                    daily.entry(date).or_insert_with(day).conversations += 1;
                }
                // Feedback is an upsert per message: only the latest vote counts.
                actions::FEEDBACK_SUBMITTED => match detail_str(entry, "messageId") {
                    Some(message_id) => match vote_index.get(message_id).copied() {
                        Some(i) if votes[i].timestamp >= entry.timestamp => {}
                        Some(i) => votes[i] = entry,
                        None => {
                            vote_index.insert(message_id, votes.len());
                            votes.push(entry);
                        }
                    },
                    None => votes.push(entry),
                },
                _ => {}
            }
        }

        let mut feedback = FeedbackStats::default();
        for vote in votes {
            match detail_str(vote, "feedback") {
                Some("helpful") => feedback.helpful += 1,
                Some("not_helpful") => {
                    feedback.not_helpful += 1;
                    if let Some(reason) = detail_str(vote, "reason") {
                        *feedback.reasons.entry(reason.to_string()).or_insert(0) += 1;
                    }
                }
                _ => {}
            }
        }

        let rated = feedback.helpful + feedback.not_helpful;
        feedback.helpful_percentage = percentage(feedback.helpful, rated);

        let total_messages: usize = models.values().sum();
        let mut model_usage: Vec<ModelUsage> = models
            .into_iter()
            .map(|(model, count)| ModelUsage {
                percentage: percentage(count, total_messages),
                model,
                count,
            })
            .collect();
        model_usage.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.model.cmp(&b.model)));

        Self {
            total_entries: entries.len(),
            model_usage,
            daily_usage: daily.into_values().collect(),
            feedback,
            by_category,
            by_level,
        }
    }
}

fn detail_str<'a>(entry: &'a LogEntry, key: &str) -> Option<&'a str> {
    entry.details.as_ref()?.get(key)?.as_str()
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 * 1000.0 / whole as f64).round() / 10.0
    }
}
