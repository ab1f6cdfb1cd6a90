use minijinja::{context, Environment};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

pub struct SystemPromptContext<'a> {
    pub widget_name: &'a str,
    pub bot_name: &'a str,
    pub bot_personality: &'a str,
    pub kb_block: &'a str,
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
            widget_name => ctx.widget_name,
            bot_name => ctx.bot_name,
            bot_personality => ctx.bot_personality,
            kb_block => ctx.kb_block,
            has_kb => !ctx.kb_block.trim().is_empty(),
        })
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut prompt = format!(
        "You are {} answering website visitors for \"{}\".\n\
         Be accurate, concise, and practical. Never invent facts.\n\
         If the visitor asks for a human, transfer, escalation, or representative, set handover=true.\n\
         If the conversation is clearly complete and resolved, set closeChat=true.\n",
        if ctx.bot_name.trim().is_empty() {
            "Support Bot"
        } else {
            ctx.bot_name.trim()
        },
        if ctx.widget_name.trim().is_empty() {
            "this practice"
        } else {
            ctx.widget_name.trim()
        }
    );

    if !ctx.bot_personality.trim().is_empty() {
        prompt.push_str("\nPersonality:\n");
        prompt.push_str(ctx.bot_personality.trim());
        prompt.push('\n');
    }

    if !ctx.kb_block.trim().is_empty() {
        prompt.push('\n');
        prompt.push_str(ctx.kb_block.trim());
        prompt.push('\n');
    }

    prompt
}
