use crate::capability::CapabilityNames;
use crate::delegation::{DELEGATE_MARKER, SEARCH_MARKER};
use crate::types::TurnContext;

pub const SEARCH_DIRECTIVE: &str = "RESPONSE RULES:
1. Be concise and direct. Avoid long paragraphs unless deeply analyzing a complex topic.
2. Just the facts. No filler like \"Here is what I found\" or \"I hope this helps\".
3. Only give lengthy, detailed explanations if the user explicitly asks for one or the topic is highly complex.
4. Do not mention how the answer was obtained.
5. Always format links as [Title](URL). Never output raw URLs.";

const PERSONA: &str = "You are DeX, a personal operating system integrated into the user's life and device. Be proactive, efficient and context-aware.";

fn context_section(ctx: &TurnContext, extra: &[String]) -> String {
    let profile = if ctx.profile.trim().is_empty() {
        "Unknown."
    } else {
        ctx.profile.trim()
    };
    let memories = if ctx.memories.is_empty() {
        "No relevant memories.".to_string()
    } else {
        ctx.memories
            .iter()
            .map(|m| format!("- {m}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let local_time = match &ctx.local_time {
        Some(t) => format!(
            "{} (UTC{})",
            t.format("%A, %Y-%m-%d %H:%M"),
            t.offset()
        ),
        None => "Unknown.".to_string(),
    };

    let mut out = format!(
        "=== CURRENT CONTEXT ===\n\
         User Profile: {profile}\n\
         Local Time: {local_time}\n\
         Relevant Memories:\n{memories}\n"
    );
    for block in extra {
        out.push('\n');
        out.push_str(block.trim());
        out.push('\n');
    }
    out
}

const TIME_PROTOCOL: &str = "=== DATE & TIME PROTOCOL ===
You are the source of truth for time. Resolve \"tomorrow\", \"next Friday\" or \"in 2 hours\" against the Local Time above.
Never ask the user what the date is. When creating tasks or reminders, infer a specific due date and time if implied.";

/// Directive of the split-topology router stage.
pub fn router_directive(ctx: &TurnContext, subsystems: &[&str], extra: &[String]) -> String {
    format!(
        "{PERSONA}\n\n{}\n{TIME_PROTOCOL}\n\n\
         === ROUTING PROTOCOL ===\n\
         Answer conversational messages yourself, briefly.\n\
         If the request needs an action or data from one of these subsystems: {}, reply with ONLY\n\
         {DELEGATE_MARKER} <SUBSYSTEM> SYS - <self-contained instruction with exact dates, times and amounts>\n\
         If the request needs real-time information from the web, reply with ONLY\n\
         {SEARCH_MARKER} <search query>\n\
         Never claim an action was done unless it was delegated.",
        context_section(ctx, extra),
        subsystems.join(", "),
    )
}

/// Directive of a stage that may invoke capabilities (action or reason+act).
pub fn action_directive(
    ctx: &TurnContext,
    names: &CapabilityNames,
    instruction: Option<&str>,
    extra: &[String],
) -> String {
    let delegated = match instruction {
        Some(i) => format!("\n=== DELEGATED INSTRUCTION ===\n{i}\n"),
        None => String::new(),
    };
    format!(
        "{PERSONA}\n\n{}\n{TIME_PROTOCOL}\n{delegated}\n\
         === CAPABILITY PROTOCOL ===\n\
         [CRITICAL REMINDER RULE]\n\
         If the user sets a CRITICAL reminder with a specific time (e.g. \"Remind me to take pills at 9 PM\"):\n\
         1. Call '{persist}' with is_critical=true and the due date/time.\n\
         2. IMMEDIATELY call '{alarm}' to set the phone alarm.\n\
         3. Its 'timestamp' (epoch milliseconds) must be at or up to one hour before the due time, computed from the Local Time above.\n\n\
         Server capabilities (data and logic) run on the backend: call them, read the result and summarize it for the user.\n\
         Device capabilities (alarm, timer, media, calls, messages) run on the user's phone: trigger them and confirm briefly.\n\
         For real-time web information call '{search}'.\n\n\
         === OUTPUT RULES ===\n\
         Keep answers short and scannable; the user is on a mobile device.\n\
         Do not reveal ids or schemas unless asked.\n\
         Never say you added or set something unless you emitted the capability call. Do not simulate actions in text.",
        context_section(ctx, extra),
        persist = names.persist_note,
        alarm = names.critical_alarm,
        search = names.search_handoff,
    )
}

/// Corrective nudge when a critical note was saved without its alarm.
pub fn missing_alarm_nudge(names: &CapabilityNames, missing: usize) -> String {
    format!(
        "You saved {missing} critical reminder(s) with a due time but did not call '{}'. \
         Call it now for each one, with the timestamp at or up to one hour before the due time.",
        names.critical_alarm
    )
}

/// Result text for a local invocation held back until the turn ends.
pub const DEFERRED_RESULT: &str = "Queued for the user's device; it runs when this reply is delivered.";
