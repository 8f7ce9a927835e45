//! Prompt rendering for panel turns, preparation briefs, persona generation, summaries and
//! knowledge merges.
//!
//! Everything here is a pure function of its inputs. The current time is passed in through
//! [`PromptContext::now`] so two renders of the same context produce the same text.

use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::focusgroup::history;
use crate::focusgroup::model::{Agent, DiscussionMessage, FocusGroupMode, RoundInfo, SearchResult, Source};

/// Colors offered to the model when it invents personas.
pub const AGENT_PALETTE: [&str; 10] = [
    "#4CAF50", "#2196F3", "#FF9800", "#9C27B0", "#E91E63", "#00BCD4", "#FF5722", "#607D8B",
    "#795548", "#3F51B5",
];

pub const ROLE_GENERATION_SYSTEM: &str =
    "You design focus group panels. Reply with a JSON array and nothing else.";

pub const KNOWLEDGE_MERGE_SYSTEM: &str = "You maintain expertise profiles. Merge and condense \
the material you are given and reply with the merged text only, without JSON or markdown.";

/// Maximum number of sources listed in a knowledge merge prompt.
pub const MAX_MERGE_SOURCES: usize = 10;

const CONTEXT_RULES: &str = "Staying on track:
- Never repeat a point that you or anyone else already made.
- Return to an earlier point only to add new evidence or to set it against someone else's argument.
- Every contribution must add something: a new argument, new evidence, a direct challenge, a synthesis or an example nobody has used yet.
- Rephrasing an existing argument or summarising others without adding insight does not count.
- Tie every statement back to the topic and the objective.
- Once a thread is well covered, push it toward an actionable conclusion.";

const SHARE_PERSPECTIVES_RULES: &str = "Mode: Share Perspectives
- Offer the viewpoint only you can bring to this topic.
- Complement other participants' angles and build on their ideas.
- Say plainly, and respectfully, where you see things differently.";

const BRAINSTORM_RULES: &str = "Mode: Brainstorm
- Generate creative and unconventional ideas.
- Extend other people's suggestions with \"yes, and\" thinking.
- Bold ideas are welcome; keep the momentum going.
- Combine perspectives into new approaches.";

const DEBATE_RULES: &str = "Mode: Debate
- Evaluate every argument critically and call out weak or unsupported reasoning.
- Bring counter-arguments and competing evidence.
- Push back directly, without being rude, when you disagree.
- The aim is to land on the strongest answer.";

const VOICE_RULES: &str = "Voice:
- Speak in the first person as you would in a real meeting, drawing on your own experience.
- Use concrete stories from your work and show genuine reactions.
- When you disagree, say so directly and say why.
- Avoid jargon, clichés and markdown headings; this is speech.
- Do not start your reply with your own name.";

const DEPTH_RULES: &str = "Substance:
- Aim for 150 to 300 words.
- Include at least one concrete example, case or data point from your field.
- Name real organisations, studies and trends rather than speaking in generalities.
- Take a position; if you are unsure, say what you would bet on and why.
- When challenging someone, name them and show where their reasoning fails.
- Prefer one well-developed argument over several shallow ones.";

const SEARCH_GRANT: &str = "Web search is available:
- Use it only to verify a claim, cite a statistic or find current data.
- Most turns should rest on your own expertise.
- Cite what you use inline as [source title](url).";

/// Which framing a round receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Independent opinions; peers' turns are hidden.
    Opening,
    /// Direct engagement with named peers.
    Engagement,
    /// Final-round synthesis.
    Synthesis,
}

/// Thresholds that map a round number to a [`RoundPhase`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundPhasePolicy {
    /// Rounds `1..=opening_rounds` are opening rounds.
    pub opening_rounds: u32,
    /// The last round is a synthesis round only when the run has at least this many rounds.
    pub synthesis_min_total_rounds: u32,
}

impl Default for RoundPhasePolicy {
    fn default() -> Self {
        Self {
            opening_rounds: 1,
            synthesis_min_total_rounds: 3,
        }
    }
}

impl RoundPhasePolicy {
    pub fn phase(&self, info: RoundInfo) -> RoundPhase {
        if info.round <= self.opening_rounds {
            RoundPhase::Opening
        } else if info.round == info.total_rounds
            && info.total_rounds >= self.synthesis_min_total_rounds
        {
            RoundPhase::Synthesis
        } else {
            RoundPhase::Engagement
        }
    }

    /// Whether peers' turns must be hidden from a turn with this metadata.
    pub fn hides_peer_turns(&self, info: Option<RoundInfo>) -> bool {
        matches!(info.map(|i| self.phase(i)), Some(RoundPhase::Opening))
    }
}

/// Inputs for the per-turn system instructions.
#[derive(Clone, Debug)]
pub struct PromptContext<'a> {
    pub agent: &'a Agent,
    pub topic: &'a str,
    pub panel: &'a [Agent],
    pub mode: FocusGroupMode,
    pub goal: Option<&'a str>,
    pub search_enabled: bool,
    pub round: Option<RoundInfo>,
    pub brief: Option<&'a str>,
    pub accumulated_insights: Option<&'a str>,
    pub timezone: &'a str,
    pub now: DateTime<Utc>,
}

/// Inputs for the per-turn user content.
#[derive(Clone, Debug)]
pub struct TurnPrompt<'a> {
    pub topic: &'a str,
    /// Log already filtered for this turn (no system notes, no peer turns in opening rounds).
    pub history: &'a [DiscussionMessage],
    pub history_budget: usize,
    pub round: Option<RoundInfo>,
    pub interjection: Option<&'a str>,
    pub panel_size: usize,
}

/// Renders every prompt the orchestrator sends.
#[derive(Clone, Copy, Debug, Default)]
pub struct PromptBuilder {
    policy: RoundPhasePolicy,
}

impl PromptBuilder {
    pub fn new(policy: RoundPhasePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RoundPhasePolicy {
        &self.policy
    }

    pub fn phase_for(&self, round: Option<RoundInfo>) -> Option<RoundPhase> {
        round.map(|info| self.policy.phase(info))
    }

    pub fn system_instructions(&self, ctx: &PromptContext<'_>) -> String {
        let agent = ctx.agent;
        let mut out = format!(
            "You are {}, a {}.\n{}\nBackground: {}\nYour perspective: {}\n\n",
            agent.name,
            agent.role,
            current_time_line(ctx.timezone, ctx.now),
            agent.background,
            agent.perspective
        );

        out.push_str(&format!(
            "You are taking part in a focus group discussion about:\n<user_topic>{}</user_topic>\n",
            ctx.topic
        ));
        if contains_cjk(ctx.topic) {
            out.push_str(
                "LANGUAGE: Reply entirely in the language of the topic and do not switch to English.\n",
            );
        }
        if let Some(goal) = ctx.goal.filter(|g| !g.trim().is_empty()) {
            out.push_str(&format!(
                "\nDiscussion goal: <user_goal>{}</user_goal>\nEverything you say should move the group toward this outcome.\n",
                goal
            ));
        }

        out.push('\n');
        out.push_str(mode_rules(ctx.mode));
        out.push_str("\n\n");
        out.push_str(CONTEXT_RULES);
        out.push('\n');

        if let Some(info) = ctx.round {
            out.push('\n');
            out.push_str(&self.phase_block(info));
            out.push('\n');
        }

        let others: Vec<String> = ctx
            .panel
            .iter()
            .filter(|a| a.name != agent.name)
            .map(|a| format!("- {} ({}): {}", a.name, a.role, a.perspective))
            .collect();
        out.push_str("\nOther participants:\n");
        out.push_str(&others.join("\n"));
        out.push_str("\n\n");
        out.push_str(VOICE_RULES);
        out.push_str("\n\n");
        out.push_str(DEPTH_RULES);

        if ctx.search_enabled {
            out.push_str("\n\n");
            out.push_str(SEARCH_GRANT);
        }
        if let Some(insights) = ctx.accumulated_insights.filter(|s| !s.trim().is_empty()) {
            out.push_str(&format!(
                "\n\nYour accumulated expertise from earlier discussions:\n{}\nUse it where it deepens your contribution.",
                insights
            ));
        }
        if let Some(brief) = ctx.brief.filter(|s| !s.trim().is_empty()) {
            out.push_str(&format!(
                "\n\nYour private preparation notes:\n{}\nDraw on whatever is relevant as the conversation unfolds.",
                brief
            ));
        }
        out
    }

    fn phase_block(&self, info: RoundInfo) -> String {
        let (title, rules) = match self.policy.phase(info) {
            RoundPhase::Opening => (
                "INDEPENDENT OPINIONS",
                "- This is an opening round: give your own position first.\n\
                 - Do not reference or build on other participants; form your view independently.\n\
                 - Take a clear stance instead of covering every side.\n\
                 - Ground it in your professional experience and concrete examples.",
            ),
            RoundPhase::Engagement => (
                "ENGAGEMENT & DEBATE",
                "- Respond to specific points other participants made, by name.\n\
                 - Challenge what you disagree with and back it with evidence.\n\
                 - Deepen others' ideas instead of restating them.\n\
                 - Bring evidence, examples or angles nobody has raised yet.",
            ),
            RoundPhase::Synthesis => (
                "SYNTHESIS & CONCLUSIONS",
                "- This is the final round: move toward actionable conclusions.\n\
                 - Identify where the group agrees and where real disagreement remains.\n\
                 - Propose concrete next steps grounded in the whole discussion.\n\
                 - Be honest about what is unresolved rather than forcing consensus.",
            ),
        };
        format!(
            "Phase: {} (Round {}/{})\n{}",
            title, info.round, info.total_rounds, rules
        )
    }

    pub fn turn_content(&self, turn: &TurnPrompt<'_>) -> String {
        let phase = self.phase_for(turn.round);

        if phase == Some(RoundPhase::Opening) {
            let mut out = format!(
                "The discussion topic is: \"{}\"\n\n\
                 This is the opening round. Share your own independent position on the topic. \
                 Do not try to be balanced; take a clear stance and support it with specific \
                 examples from your professional background. Open with what strikes you most, \
                 then build the argument with concrete evidence.",
                turn.topic
            );
            if !turn.history.is_empty() {
                out.push_str("\n\nNotes from the moderator so far:\n\n");
                out.push_str(&history::compress(turn.history, turn.history_budget));
            }
            if let Some(text) = turn.interjection {
                out.push_str(&format!(
                    "\n\nThe moderator has just interjected: \"{}\"\n\nAddress it in your opening position.",
                    text
                ));
            }
            return out;
        }

        if turn.history.is_empty() {
            let mut out = format!(
                "The discussion topic is: \"{}\"\n\nYou are the first to speak. Open the discussion with your perspective.",
                turn.topic
            );
            if let Some(text) = turn.interjection {
                out.push_str(&format!(
                    "\n\nThe moderator has asked: \"{}\"",
                    text
                ));
            }
            return out;
        }

        let recent_window = turn.history.len().saturating_sub(turn.panel_size.max(1));
        let recent_moderator = turn.history[recent_window..]
            .iter()
            .any(|m| matches!(m, DiscussionMessage::User(_)));

        let instruction = if let Some(text) = turn.interjection {
            format!(
                "The moderator has just interjected: \"{}\"\n\nRespond to the moderator's point and keep the discussion moving.",
                text
            )
        } else if phase == Some(RoundPhase::Synthesis) {
            "This is the final round. Time to synthesise:\n\
             - What are the one or two most important takeaways?\n\
             - Where does the group agree, and where does real disagreement remain?\n\
             - What concrete next step would you recommend?\n\n\
             Do not manufacture consensus where there is none."
                .to_string()
        } else if recent_moderator {
            "The moderator recently gave feedback. Acknowledge and address it while continuing the discussion."
                .to_string()
        } else {
            "It is your turn. Engage directly with what specific participants said: name them, \
             challenge their reasoning or extend their ideas with new evidence. Do not simply \
             restate your earlier position."
                .to_string()
        };

        format!(
            "Here is the discussion so far:\n\n{}\n\n{}",
            history::compress(turn.history, turn.history_budget),
            instruction
        )
    }

    /// Appended to the turn content when a search ran before generation.
    pub fn research_note(&self, query: &str, results: &[SearchResult]) -> String {
        let lines: Vec<String> = results
            .iter()
            .map(|r| format!("- {} ({}): {}", r.title, r.url, r.description))
            .collect();
        format!(
            "\n\nResearch results for \"{}\" (cite inline as [title](url) only if you use them):\n{}",
            query,
            lines.join("\n")
        )
    }

    pub fn role_generation_prompt(&self, topic: &str, count: usize) -> String {
        format!(
            "Design a focus group panel for this discussion topic:\n\n\"{topic}\"\n\n\
             Create exactly {count} participants with clearly different perspectives on the topic: \
             a mix of domain experts, practitioners, skeptics, end users and insiders as fits.\n\n\
             Reply with a JSON array only. Every object needs:\n\
             - \"name\": a realistic name, optionally with a title\n\
             - \"role\": their professional title\n\
             - \"background\": one or two sentences of relevant background\n\
             - \"perspective\": their likely stance on the topic\n\
             - \"color\": one of {palette}\n\n\
             Example:\n\
             [{{\"name\":\"Dr. Lena Ortiz\",\"role\":\"Public Health Researcher\",\"background\":\"Twelve years studying community health programs.\",\"perspective\":\"evidence-first pragmatist\",\"color\":\"#2196F3\"}}]",
            topic = topic,
            count = count,
            palette = AGENT_PALETTE.join(", ")
        )
    }

    pub fn brief_system(&self, agent: &Agent) -> String {
        format!(
            "You are {}, a {}. Background: {}. Perspective: {}.\n\nYou are preparing for a focus group discussion. Organise your thoughts from your own expertise.",
            agent.name, agent.role, agent.background, agent.perspective
        )
    }

    pub fn brief_prompt(&self, topic: &str, goal: Option<&str>, search_enabled: bool) -> String {
        let goal_line = goal
            .filter(|g| !g.trim().is_empty())
            .map(|g| format!("\nGoal: {}", g))
            .unwrap_or_default();
        let research = if search_enabled {
            "Look for recent data, statistics or news on this topic that bear on your expertise."
        } else {
            "Draw on your domain expertise."
        };
        format!(
            "The upcoming discussion topic is: \"{topic}\"{goal_line}\n\n\
             Prepare before the discussion:\n\
             1. {research}\n\
             2. Write a private position note of 4 to 6 bullet points covering your initial stance and \
             the evidence behind it, two or three concrete data points or cases you will use, the \
             blind spots others are likely to have, and one provocative question for the group.\n\n\
             Keep it short, write in the first person and use the same language as the topic."
        )
    }

    /// System and user prompts for the end-of-discussion summary.
    pub fn summary_prompts(&self, topic: &str, panel: &[Agent], transcript: &str) -> (String, String) {
        let head: String = transcript.chars().take(500).collect();
        let cjk = contains_cjk(topic) || contains_cjk(&head);
        let participants = panel
            .iter()
            .map(|a| format!("{} ({})", a.name, a.role))
            .collect::<Vec<_>>()
            .join(", ");

        let system = if cjk {
            "你是一位專業的會議主持人。只回覆完整有效的 JSON，不要使用 markdown 代碼框。除了 priority（high/medium/low）以外，所有文字都必須使用中文。保持簡潔以確保 JSON 完整。"
        } else {
            "You are an experienced meeting facilitator. Reply with complete, valid JSON only and no code fences. Keep each field short so the JSON is complete."
        };
        let language_rule = if cjk {
            "語言規則：所有 JSON 文字值都使用中文，只有 priority 使用 high/medium/low。"
        } else {
            "Language: write every text value in the language of the transcript. Only \"priority\" uses the English values high, medium or low."
        };

        let user = format!(
            "Analyse this focus group discussion and produce a structured summary.\n\n\
             Topic: \"{topic}\"\n\nParticipants: {participants}\n\nTranscript:\n{transcript}\n\n\
             Keep it concise: at most two short paragraphs of summary, one or two sentences per \
             insight, one sentence per rationale, at most six insights.\n\n{language_rule}\n\n\
             Reply with JSON in exactly this shape:\n\
             {{\n  \"summary\": \"...\",\n  \"keyInsights\": [\"...\"],\n  \"todos\": [\n    {{\"task\": \"...\", \"priority\": \"high|medium|low\", \"rationale\": \"...\"}}\n  ],\n  \"dissent\": \"...\"\n}}"
        );
        (system.to_string(), user)
    }

    pub fn knowledge_merge_prompt(
        &self,
        agent: &Agent,
        existing: Option<&str>,
        topic: &str,
        contributions: &str,
        sources: &[Source],
        today: DateTime<Utc>,
    ) -> String {
        let existing = existing
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("(no earlier knowledge)");
        let source_block = if sources.is_empty() {
            String::new()
        } else {
            let lines: Vec<String> = sources
                .iter()
                .take(MAX_MERGE_SOURCES)
                .map(|s| {
                    let label = if s.title.is_empty() { &s.url } else { &s.title };
                    format!("- {} ({})", label, s.url)
                })
                .collect();
            format!("\n\nSources referenced in this session:\n{}", lines.join("\n"))
        };
        format!(
            "Today's date: {date}\n\n\
             You are updating the expertise profile of \"{name}\" ({role}).\n\n\
             Existing profile:\n{existing}\n\n\
             New session on \"{topic}\". Their contributions:\n{contributions}{source_block}\n\n\
             Merge the existing profile and the new material into one updated profile:\n\
             - Organise by theme, not chronologically.\n\
             - Keep actionable insights and distinctive perspectives.\n\
             - Remove redundancy and keep the richer version of overlapping points.\n\
             - Date time-sensitive figures (\"as of {month}\") and prefer newer data when old and new conflict.\n\
             - Stay within about 400 words.\n\
             - Write in the third person.\n\
             - Keep specific data points, cases and named examples.",
            date = today.format("%Y-%m-%d"),
            month = today.format("%b %Y"),
            name = agent.name,
            role = agent.role,
        )
    }
}

fn mode_rules(mode: FocusGroupMode) -> &'static str {
    match mode {
        FocusGroupMode::SharePerspectives => SHARE_PERSPECTIVES_RULES,
        FocusGroupMode::Brainstorm => BRAINSTORM_RULES,
        FocusGroupMode::Debate => DEBATE_RULES,
    }
}

/// True when the text contains CJK unified ideographs (including extension A).
pub fn contains_cjk(text: &str) -> bool {
    text.chars()
        .any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c) || ('\u{3400}'..='\u{4dbf}').contains(&c))
}

/// A session clock: an IANA zone such as `Asia/Hong_Kong`, or a fixed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionZone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl SessionZone {
    /// Render `now` as a long local date and time in this zone.
    pub fn format_local(&self, now: DateTime<Utc>) -> String {
        const LONG: &str = "%A, %B %-d, %Y, %I:%M %p";
        match self {
            SessionZone::Named(tz) => now.with_timezone(tz).format(LONG).to_string(),
            SessionZone::Fixed(offset) => now.with_timezone(offset).format(LONG).to_string(),
        }
    }
}

/// Parse an IANA zone name (`Asia/Hong_Kong`, `UTC`), or a fixed offset such as `+08:00`,
/// `-0530` or `GMT+2`. Anything else yields `None`.
pub fn parse_timezone(label: &str) -> Option<SessionZone> {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(tz) = trimmed.parse::<Tz>() {
        return Some(SessionZone::Named(tz));
    }
    parse_fixed_offset(trimmed).map(SessionZone::Fixed)
}

fn parse_fixed_offset(label: &str) -> Option<FixedOffset> {
    let rest = label
        .strip_prefix("UTC")
        .or_else(|| label.strip_prefix("GMT"))
        .unwrap_or(label);
    if rest.is_empty() || rest == "Z" {
        return FixedOffset::east_opt(0);
    }

    let (sign, digits) = if let Some(digits) = rest.strip_prefix('+') {
        (1, digits)
    } else if let Some(digits) = rest.strip_prefix('-') {
        (-1, digits)
    } else {
        return None;
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit() || c == ':') {
        return None;
    }
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (h, m),
        None if digits.len() == 4 => (digits.get(..2)?, digits.get(2..)?),
        None => (digits, "0"),
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn current_time_line(timezone: &str, now: DateTime<Utc>) -> String {
    match parse_timezone(timezone) {
        Some(zone) => format!(
            "Current date and time: {} ({})",
            zone.format_local(now),
            timezone.trim()
        ),
        None => format!("Current date: {} (UTC)", now.format("%Y-%m-%d")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round(round: u32, total_rounds: u32) -> RoundInfo {
        RoundInfo {
            round,
            total_rounds,
        }
    }

    #[test]
    fn default_policy_phases() {
        let policy = RoundPhasePolicy::default();
        assert_eq!(policy.phase(round(1, 3)), RoundPhase::Opening);
        assert_eq!(policy.phase(round(2, 3)), RoundPhase::Engagement);
        assert_eq!(policy.phase(round(3, 3)), RoundPhase::Synthesis);
        // Two-round runs never get a synthesis round.
        assert_eq!(policy.phase(round(2, 2)), RoundPhase::Engagement);
        assert_eq!(policy.phase(round(1, 1)), RoundPhase::Opening);
    }

    #[test]
    fn custom_policy_thresholds() {
        let policy = RoundPhasePolicy {
            opening_rounds: 2,
            synthesis_min_total_rounds: 2,
        };
        assert_eq!(policy.phase(round(2, 4)), RoundPhase::Opening);
        assert_eq!(policy.phase(round(3, 4)), RoundPhase::Engagement);
        assert_eq!(policy.phase(round(4, 4)), RoundPhase::Synthesis);
    }

    #[test]
    fn timezone_parsing() {
        let fixed = |secs| FixedOffset::east_opt(secs).map(SessionZone::Fixed);
        assert_eq!(parse_timezone("UTC"), Some(SessionZone::Named(Tz::UTC)));
        assert_eq!(
            parse_timezone(" Asia/Hong_Kong "),
            Some(SessionZone::Named(Tz::Asia__Hong_Kong))
        );
        assert_eq!(parse_timezone("+08:00"), fixed(8 * 3600));
        assert_eq!(parse_timezone("UTC-0530"), fixed(-(5 * 3600 + 1800)));
        assert_eq!(parse_timezone("GMT+2"), fixed(2 * 3600));
        assert_eq!(parse_timezone("Mars/Olympus_Mons"), None);
        assert_eq!(parse_timezone("+25:00"), None);
        assert_eq!(parse_timezone(""), None);
    }

    #[test]
    fn malformed_offsets_never_panic() {
        for label in ["+a€", "-€€", "+1€", "UTC+é9", "+", "-:", "+12:€"] {
            assert_eq!(parse_timezone(label), None, "{label}");
        }
    }

    #[test]
    fn named_zone_shows_local_time() {
        let now = DateTime::parse_from_rfc3339("2025-03-01T04:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let line = current_time_line("Asia/Hong_Kong", now);
        assert!(line.contains("March 1, 2025, 12:30 PM"), "{line}");
        assert!(line.ends_with("(Asia/Hong_Kong)"));

        let fallback = current_time_line("+a€", now);
        assert_eq!(fallback, "Current date: 2025-03-01 (UTC)");
    }

    #[test]
    fn cjk_detection() {
        assert!(contains_cjk("遠距工作的未來"));
        assert!(!contains_cjk("remote work"));
    }
}
