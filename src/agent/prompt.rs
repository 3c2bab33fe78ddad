//! System prompt assembly.

use crate::skills::WorkspaceContext;
use std::path::Path;

pub struct PromptInputs<'a> {
    pub workspace: &'a WorkspaceContext,
    pub workspace_dir: &'a Path,
    /// Contents of memory/MEMORY.md, if present
    pub long_term_memory: Option<String>,
    pub channel_id: &'a str,
    pub is_group: bool,
    pub sandbox_available: bool,
    /// Depth of this session in the subagent tree (0 = top level)
    pub depth: u32,
    pub max_subagent_depth: u32,
    /// Extra suffix for subagent runs
    pub subagent_suffix: bool,
}

pub fn assemble_system_prompt(inputs: &PromptInputs) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(
        "You are a personal assistant agent. You have tools for files, shell, web, \
         memory, scheduling, and subagents; use them when they help, and answer \
         directly when they don't. Reply with NO_REPLY when nothing needs to be said."
            .to_string(),
    );

    if !inputs.workspace.bootstrap.is_empty() {
        sections.push(inputs.workspace.bootstrap.clone());
    }

    sections.push(format!(
        "## Workspace\nYour workspace is at {}. Long-term memory docs live in \
         memory/MEMORY.md and memory/HISTORY.md under it.",
        inputs.workspace_dir.display()
    ));

    if let Some(ref memory) = inputs.long_term_memory {
        if !memory.trim().is_empty() {
            sections.push(format!("## Long-term memory\n{}", memory.trim()));
        }
    }

    if !inputs.workspace.skills.is_empty() {
        let mut section = String::from("## Skills\n");
        for skill in &inputs.workspace.skills {
            section.push_str(&format!("### {}\n{}\n", skill.name, skill.content));
        }
        sections.push(section.trim_end().to_string());
    }

    sections.push(format!(
        "## Runtime\nos: {} | time: {} | cwd: {}",
        std::env::consts::OS,
        chrono::Local::now().to_rfc3339(),
        std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
    ));

    if inputs.sandbox_available {
        sections.push(
            "## Sandbox\nShell commands run in a sandboxed environment; long commands \
             are subject to a timeout."
                .to_string(),
        );
    }

    if inputs.depth < inputs.max_subagent_depth {
        sections.push(
            "## Subagents\nYou may spawn background subagents for independent tasks. \
             Their results come back to you as system messages."
                .to_string(),
        );
    }

    sections.push(format!(
        "## Channel\nchannel: {} | {}",
        inputs.channel_id,
        if inputs.is_group { "group chat" } else { "direct message" },
    ));

    if inputs.subagent_suffix {
        sections.push(subagent_suffix(inputs.depth, inputs.max_subagent_depth));
    }

    sections.join("\n\n")
}

/// Extra prompt for subagent runs: identifies the run, forbids user-facing
/// behavior, and gates further fan-out on remaining depth.
fn subagent_suffix(depth: u32, max_depth: u32) -> String {
    let mut suffix = String::from(
        "## Subagent run\nYou are running as a background subagent. Work the task and \
         return the result as your final message. Do not address the user directly, \
         do not send greetings, and do not create scheduled jobs.",
    );
    if depth < max_depth {
        suffix.push_str(" You may spawn further subagents if the task genuinely needs them.");
    } else {
        suffix.push_str(" You are at maximum depth: do not spawn further subagents.");
    }
    suffix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::Skill;

    fn inputs<'a>(
        workspace: &'a WorkspaceContext,
        dir: &'a Path,
        subagent: bool,
        depth: u32,
    ) -> PromptInputs<'a> {
        PromptInputs {
            workspace,
            workspace_dir: dir,
            long_term_memory: Some("Sam prefers short answers".to_string()),
            channel_id: "42",
            is_group: false,
            sandbox_available: true,
            depth,
            max_subagent_depth: 2,
            subagent_suffix: subagent,
        }
    }

    #[test]
    fn includes_memory_skills_and_runtime() {
        let workspace = WorkspaceContext {
            bootstrap: "## SOUL.md\nbe kind".to_string(),
            skills: vec![Skill {
                name: "review".to_string(),
                content: "review carefully".to_string(),
            }],
        };
        let dir = std::env::temp_dir();
        let prompt = assemble_system_prompt(&inputs(&workspace, &dir, false, 0));
        assert!(prompt.contains("be kind"));
        assert!(prompt.contains("Sam prefers short answers"));
        assert!(prompt.contains("### review"));
        assert!(prompt.contains("## Runtime"));
        assert!(!prompt.contains("## Subagent run"));
    }

    #[test]
    fn subagent_suffix_forbids_user_facing_behavior() {
        let workspace = WorkspaceContext::default();
        let dir = std::env::temp_dir();
        let prompt = assemble_system_prompt(&inputs(&workspace, &dir, true, 1));
        assert!(prompt.contains("## Subagent run"));
        assert!(prompt.contains("do not send greetings"));
        assert!(prompt.contains("may spawn further subagents"));
    }

    #[test]
    fn max_depth_subagent_cannot_spawn_more() {
        let workspace = WorkspaceContext::default();
        let dir = std::env::temp_dir();
        let prompt = assemble_system_prompt(&inputs(&workspace, &dir, true, 2));
        assert!(prompt.contains("maximum depth"));
        assert!(!prompt.contains("## Subagents\n"));
    }
}
