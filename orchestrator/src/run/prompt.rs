//! Renders the prompt handed to the executor from the crew recipe.

use serde_json::{Map, Value};

use super::store::{CrewRecipe, Instructions};

/// Sections are joined by blank lines; empty ones are left out. The task
/// itself always comes last.
pub fn render_prompt(prompt: &str, recipe: &CrewRecipe, inputs: &Map<String, Value>) -> String {
    let mut segments = Vec::new();

    if let Some(mission) = recipe.mission.as_deref().filter(|m| !m.is_empty()) {
        segments.push(format!("Mission: {mission}"));
    }

    match &recipe.instructions {
        Some(Instructions::Steps(steps)) if !steps.is_empty() => {
            let bullets: Vec<String> = steps.iter().map(|step| format!("- {step}")).collect();
            segments.push(format!("Instructions:\n{}", bullets.join("\n")));
        }
        Some(Instructions::Text(text)) if !text.is_empty() => {
            segments.push(format!("Instructions:\n{text}"));
        }
        _ => {}
    }

    if !recipe.tools.is_empty() {
        let lines: Vec<String> = recipe
            .tools
            .iter()
            .map(|(name, details)| format!("- {name}: {details}"))
            .collect();
        segments.push(format!("Available tools:\n{}", lines.join("\n")));
    }

    if !recipe.env.is_empty() {
        let lines: Vec<String> = recipe
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        segments.push(format!("Environment:\n{}", lines.join("\n")));
    }

    if !inputs.is_empty() {
        let context = serde_json::to_string_pretty(inputs)
            .unwrap_or_else(|_| Value::Object(inputs.clone()).to_string());
        segments.push(format!("Run inputs:\n{context}"));
    }

    segments.push(format!("Task:\n{prompt}"));
    segments.join("\n\n")
}
