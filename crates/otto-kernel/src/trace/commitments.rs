//! Deterministic commitment detection
//!
//! A verb/noun scan over the raw user request, used as a cross-check on
//! the LLM's candidate tags at planning time; the orchestrator records the
//! union of both. Exposed as a free function so the heuristic is testable
//! in isolation. The pattern table is code, not data: extending the tag
//! set is a deliberate change.

use super::CommitmentTag;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Mentions of email as a channel, verb or noun.
    static ref EMAIL_CHANNEL: Regex = Regex::new(r"(?i)\b(email|e-mail|inbox|mail)\b").unwrap();
    /// Delivery verbs that imply sending something outward.
    static ref DELIVERY_VERB: Regex = Regex::new(r"(?i)\b(email|e-mail|mail|send|share|forward)\b").unwrap();
    /// Artifact nouns worth attaching or linking.
    static ref ARTIFACT_NOUN: Regex = Regex::new(
        r"(?i)\b(report|summary|slides?|slideshow|presentation|keynote|deck|documents?|docs?|files?|links?|pdf|attachments?|notes)\b"
    )
    .unwrap();
    static ref PLAY_VERB: Regex = Regex::new(r"(?i)\b(play|queue|put on|listen)\b").unwrap();
    static ref MUSIC_NOUN: Regex =
        Regex::new(r"(?i)\b(music|songs?|tracks?|albums?|playlists?)\b").unwrap();
    static ref SOCIAL_POST: Regex = Regex::new(
        r"(?i)\b(tweet|post|publish)\b.*\b(twitter|mastodon|linkedin|bluesky|social|thread|timeline|feed)\b|\btweet\b"
    )
    .unwrap();
    static ref CREATE_VERB: Regex =
        Regex::new(r"(?i)\b(create|make|write|draft|prepare|generate|build|put together)\b").unwrap();
    static ref DOCUMENT_NOUN: Regex = Regex::new(
        r"(?i)\b(report|document|keynote|slideshow|presentation|slides|deck|pages doc|write-?up)\b"
    )
    .unwrap();
    static ref SCHEDULE_VERB: Regex =
        Regex::new(r"(?i)\b(schedule|book|set up|add|put|block)\b").unwrap();
    static ref EVENT_NOUN: Regex = Regex::new(
        r"(?i)\b(meetings?|events?|appointments?|calls?|reminders?|calendar)\b"
    )
    .unwrap();
}

/// Scan a user request for commitment-bearing phrasing.
///
/// Returns tags in [`CommitmentTag::ALL`] order, each at most once. The
/// scan is intentionally shallow — proximity of a delivery verb and an
/// artifact noun, not grammar — and is unioned with the planner's own
/// candidates rather than trusted alone.
pub fn detect_commitments(request: &str) -> Vec<CommitmentTag> {
    let mut tags = Vec::new();
    for tag in CommitmentTag::ALL {
        let detected = match tag {
            CommitmentTag::SendEmail => {
                EMAIL_CHANNEL.is_match(request)
                    || (DELIVERY_VERB.is_match(request) && ARTIFACT_NOUN.is_match(request))
            }
            CommitmentTag::AttachDocuments => {
                DELIVERY_VERB.is_match(request) && ARTIFACT_NOUN.is_match(request)
            }
            CommitmentTag::PlayMusic => {
                PLAY_VERB.is_match(request) && MUSIC_NOUN.is_match(request)
            }
            CommitmentTag::PostSocial => SOCIAL_POST.is_match(request),
            CommitmentTag::CreateDocument => {
                CREATE_VERB.is_match(request) && DOCUMENT_NOUN.is_match(request)
            }
            CommitmentTag::ScheduleEvent => {
                SCHEDULE_VERB.is_match(request) && EVENT_NOUN.is_match(request)
            }
        };
        if detected {
            tags.push(tag);
        }
    }
    tags
}
