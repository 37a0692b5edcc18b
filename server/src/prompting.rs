use minijinja::{context, Environment};

use crate::types::{Channel, Passage};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");
const CONTEXT_TEMPLATE: &str = include_str!("prompts/context.j2");

pub struct SystemPromptContext<'a> {
    pub page_name: &'a str,
    pub custom_prompt: &'a str,
    pub language: &'a str,
    pub channel: Channel,
}

pub struct ContextPromptContext<'a> {
    pub message: &'a str,
    pub participant_name: &'a str,
    pub passages: &'a [Passage],
    pub parent_text: Option<&'a str>,
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(ctx);
    };

    template
        .render(context! {
            page_name => display_page_name(ctx.page_name),
            custom_prompt => ctx.custom_prompt.trim(),
            language => ctx.language.trim(),
            channel => ctx.channel.as_str(),
        })
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

pub fn render_context(ctx: &ContextPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env.add_template("context", CONTEXT_TEMPLATE).is_err() {
        return fallback_context(ctx);
    }

    let Ok(template) = env.get_template("context") else {
        return fallback_context(ctx);
    };

    template
        .render(context! {
            message => ctx.message.trim(),
            participant_name => ctx.participant_name.trim(),
            passages => ctx.passages,
            parent_text => ctx.parent_text.map(str::trim).filter(|text| !text.is_empty()),
        })
        .map(|rendered| rendered.trim().to_string())
        .unwrap_or_else(|_| fallback_context(ctx))
}

fn display_page_name(name: &str) -> &str {
    if name.trim().is_empty() {
        "this page"
    } else {
        name.trim()
    }
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut prompt = format!(
        "You are the assistant for the page \"{}\".\n\
         Be accurate, concise, and practical. Never invent facts.\n\
         If the customer asks for a human, set handover=true.\n\
         Answer with JSON only: {{\"reply\": \"...\", \"handover\": false}}\n",
        display_page_name(ctx.page_name)
    );

    if ctx.channel == Channel::Comment {
        prompt.push_str("You are replying publicly under a post comment. Keep it short.\n");
    }

    if !ctx.language.trim().is_empty() {
        prompt.push_str(&format!("Always answer in {}.\n", ctx.language.trim()));
    }

    if !ctx.custom_prompt.trim().is_empty() {
        prompt.push_str("\nPage instructions:\n");
        prompt.push_str(ctx.custom_prompt.trim());
        prompt.push('\n');
    }

    prompt
}

fn fallback_context(ctx: &ContextPromptContext<'_>) -> String {
    let mut out = String::new();

    if !ctx.passages.is_empty() {
        out.push_str("Knowledge base:\n");
        for (index, passage) in ctx.passages.iter().enumerate() {
            out.push_str(&format!("[{}] {}\n", index + 1, passage.text.trim()));
        }
        out.push('\n');
    }

    if let Some(parent) = ctx.parent_text.map(str::trim).filter(|text| !text.is_empty()) {
        out.push_str("The customer is replying to this comment:\n");
        out.push_str(parent);
        out.push_str("\n\n");
    }

    out.push_str("Customer: ");
    out.push_str(ctx.message.trim());
    out
}
