//! Exemplar selection
//!
//! The planning prompt carries a small set of few-shot exemplars matched
//! to the request's task type, capped by a token budget. Selection is
//! deterministic: exemplars are ranked by distance from the classified
//! task type (ties broken by index) and dropped farthest-first when the
//! budget runs out. The core rules block is never part of this budget.

use serde::{Deserialize, Serialize};

/// Coarse task-type classification of a user request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    FileManagement,
    EmailFlow,
    DocumentCreation,
    Research,
    Media,
    Social,
    Scheduling,
    General,
}

/// Keyword-based classifier. First match in priority order wins; requests
/// that match nothing are `General`.
pub fn classify(request: &str) -> TaskKind {
    let lower = request.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if has(&["duplicate", "folder", "disk", "organize files", "clean up files"]) {
        TaskKind::FileManagement
    } else if has(&["email", "e-mail", "inbox", "mail"]) {
        TaskKind::EmailFlow
    } else if has(&["slideshow", "presentation", "keynote", "report", "document", "slides", "deck"]) {
        TaskKind::DocumentCreation
    } else if has(&["search", "look up", "find out", "research", "news"]) {
        TaskKind::Research
    } else if has(&["play", "music", "song", "playlist"]) {
        TaskKind::Media
    } else if has(&["tweet", "post", "mastodon", "social"]) {
        TaskKind::Social
    } else if has(&["schedule", "calendar", "meeting", "appointment", "remind"]) {
        TaskKind::Scheduling
    } else {
        TaskKind::General
    }
}

/// Distance between the request's kind and an exemplar's kind: 0 for an
/// exact match, 1 when either side is `General`, 2 otherwise.
fn distance(request_kind: TaskKind, exemplar_kind: TaskKind) -> u8 {
    if request_kind == exemplar_kind {
        0
    } else if request_kind == TaskKind::General || exemplar_kind == TaskKind::General {
        1
    } else {
        2
    }
}

/// Rough token estimate: four characters per token.
fn estimate_tokens(text: &str) -> usize {
    text.len() / 4 + 1
}

/// One indexed few-shot example.
#[derive(Debug, Clone)]
pub struct Exemplar {
    pub kind: TaskKind,
    pub request: &'static str,
    pub plan_json: &'static str,
}

impl Exemplar {
    fn tokens(&self) -> usize {
        estimate_tokens(self.request) + estimate_tokens(self.plan_json)
    }
}

/// The indexed exemplar corpus.
pub struct ExemplarIndex {
    exemplars: Vec<Exemplar>,
}

impl ExemplarIndex {
    pub fn new(exemplars: Vec<Exemplar>) -> Self {
        Self { exemplars }
    }

    /// Built-in corpus covering the common task shapes.
    pub fn builtin() -> Self {
        Self::new(vec![
            Exemplar {
                kind: TaskKind::FileManagement,
                request: "what files are duplicated?",
                plan_json: r#"{"goal":"list duplicate files","steps":[{"id":1,"action":"folder_find_duplicates","parameters":{"folder_path":null},"dependencies":[],"reasoning":"scan for duplicates","expected_output":"duplicate groups with wasted space"},{"id":2,"action":"reply_to_user","parameters":{"message":"Found {$step1.total_duplicate_groups} group(s) of duplicate files, wasting {$step1.wasted_space_mb} MB","details":"$step1.duplicates"},"dependencies":[1],"reasoning":"report findings","expected_output":"summary with the duplicate list"}]}"#,
            },
            Exemplar {
                kind: TaskKind::EmailFlow,
                request: "summarize my last 3 emails and email the report",
                plan_json: r#"{"goal":"summarize recent email and send the report","steps":[{"id":1,"action":"read_latest_emails","parameters":{"count":3},"dependencies":[],"reasoning":"fetch the emails","expected_output":"three most recent messages"},{"id":2,"action":"summarize_emails","parameters":{"emails":"$step1.emails"},"dependencies":[1],"reasoning":"condense them","expected_output":"a short summary"},{"id":3,"action":"create_detailed_report","parameters":{"content":"$step2.summary"},"dependencies":[2],"reasoning":"write the report file","expected_output":"a report document"},{"id":4,"action":"compose_email","parameters":{"subject":"Email summary report","body":"$step2.summary","attachments":["$step3.file_path"],"send":true},"dependencies":[2,3],"reasoning":"deliver the report","expected_output":"email sent with the report attached"},{"id":5,"action":"reply_to_user","parameters":{"message":"Sent you a report summarizing your last 3 emails."},"dependencies":[4],"reasoning":"confirm","expected_output":"confirmation"}]}"#,
            },
            Exemplar {
                kind: TaskKind::DocumentCreation,
                request: "create a slideshow about coral reefs and email it to me",
                plan_json: r#"{"goal":"create and deliver a coral reef slideshow","steps":[{"id":1,"action":"create_keynote","parameters":{"topic":"coral reefs"},"dependencies":[],"reasoning":"build the deck","expected_output":"a keynote file"},{"id":2,"action":"compose_email","parameters":{"subject":"Coral reef slideshow","body":"Attached is the slideshow you asked for.","attachments":["$step1.file_path"],"send":true},"dependencies":[1],"reasoning":"send it","expected_output":"email sent with the deck attached"},{"id":3,"action":"reply_to_user","parameters":{"message":"Created the slideshow and emailed it to you."},"dependencies":[2],"reasoning":"confirm","expected_output":"confirmation"}]}"#,
            },
            Exemplar {
                kind: TaskKind::Research,
                request: "what's the latest on the Artemis program?",
                plan_json: r#"{"goal":"look up recent Artemis program news","steps":[{"id":1,"action":"web_search","parameters":{"query":"Artemis program latest news"},"dependencies":[],"reasoning":"fetch current coverage","expected_output":"recent articles"},{"id":2,"action":"summarize_results","parameters":{"items":"$step1.items"},"dependencies":[1],"reasoning":"condense into an answer","expected_output":"a concise update"},{"id":3,"action":"reply_to_user","parameters":{"message":"$step2.summary","details":"$step1.items"},"dependencies":[1,2],"reasoning":"answer with sources","expected_output":"the update plus links"}]}"#,
            },
            Exemplar {
                kind: TaskKind::Media,
                request: "play some focus music",
                plan_json: r#"{"goal":"start focus music","steps":[{"id":1,"action":"play_music","parameters":{"query":"focus instrumental"},"dependencies":[],"reasoning":"start playback","expected_output":"music playing"},{"id":2,"action":"reply_to_user","parameters":{"message":"Now playing: {$step1.now_playing}"},"dependencies":[1],"reasoning":"confirm","expected_output":"confirmation with the track"}]}"#,
            },
            Exemplar {
                kind: TaskKind::Scheduling,
                request: "schedule a 30 minute sync with Alex tomorrow morning",
                plan_json: r#"{"goal":"schedule a sync with Alex","steps":[{"id":1,"action":"create_calendar_event","parameters":{"title":"Sync with Alex","duration_minutes":30,"when":"tomorrow morning"},"dependencies":[],"reasoning":"book the slot","expected_output":"calendar event created"},{"id":2,"action":"reply_to_user","parameters":{"message":"Booked: {$step1.title} at {$step1.start_time}."},"dependencies":[1],"reasoning":"confirm","expected_output":"confirmation"}]}"#,
            },
        ])
    }

    pub fn len(&self) -> usize {
        self.exemplars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exemplars.is_empty()
    }

    /// Select exemplars for a request kind under a token budget.
    ///
    /// Candidates are ordered by (distance, index); the budget admits them
    /// in that order, so when it tightens, the farthest matches drop first.
    pub fn select(&self, kind: TaskKind, token_budget: usize) -> Vec<&Exemplar> {
        let mut ranked: Vec<(u8, usize, &Exemplar)> = self
            .exemplars
            .iter()
            .enumerate()
            .map(|(index, exemplar)| (distance(kind, exemplar.kind), index, exemplar))
            .collect();
        ranked.sort_by_key(|(d, index, _)| (*d, *index));

        let mut selected = Vec::new();
        let mut spent = 0usize;
        for (_, _, exemplar) in ranked {
            let cost = exemplar.tokens();
            if spent + cost > token_budget {
                continue;
            }
            spent += cost;
            selected.push(exemplar);
        }
        selected
    }

    /// Render selected exemplars as a prompt block.
    pub fn render(&self, kind: TaskKind, token_budget: usize) -> String {
        let selected = self.select(kind, token_budget);
        let mut block = String::new();
        for exemplar in selected {
            block.push_str(&format!(
                "Request: {}\nPlan: {}\n\n",
                exemplar.request, exemplar.plan_json
            ));
        }
        block
    }
}
