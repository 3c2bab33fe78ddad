//! Workspace-sourced prompt material, read once at startup.
//!
//! Skills are markdown docs under `workspace/skills/` (`*.md` at the top
//! level, or `<name>/SKILL.md` one level down). Bootstrap context is the
//! concatenation of a fixed set of optional root-level markdowns.

use std::path::Path;
use walkdir::WalkDir;

/// Root-level markdowns folded into the system prompt, in order.
/// `CLAUDE.md` is the legacy alias for `AGENTS.md`.
const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"];
const LEGACY_AGENTS_ALIAS: &str = "CLAUDE.md";

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub content: String,
}

/// Process-initialized-once snapshot of workspace prompt material.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceContext {
    pub bootstrap: String,
    pub skills: Vec<Skill>,
}

impl WorkspaceContext {
    pub fn load(workspace_dir: &Path) -> Self {
        let context = WorkspaceContext {
            bootstrap: load_bootstrap(workspace_dir),
            skills: load_skills(&workspace_dir.join("skills")),
        };
        log::info!(
            "[WORKSPACE] Loaded {} bootstrap chars, {} skill(s)",
            context.bootstrap.len(),
            context.skills.len()
        );
        context
    }
}

fn load_bootstrap(workspace_dir: &Path) -> String {
    let mut sections = Vec::new();
    for name in BOOTSTRAP_FILES {
        let path = workspace_dir.join(name);
        let content = if *name == "AGENTS.md" && !path.exists() {
            std::fs::read_to_string(workspace_dir.join(LEGACY_AGENTS_ALIAS)).ok()
        } else {
            std::fs::read_to_string(&path).ok()
        };
        if let Some(content) = content {
            let trimmed = content.trim();
            if !trimmed.is_empty() {
                sections.push(format!("## {}\n{}", name, trimmed));
            }
        }
    }
    sections.join("\n\n")
}

fn load_skills(skills_dir: &Path) -> Vec<Skill> {
    let mut skills = Vec::new();
    if !skills_dir.exists() {
        return skills;
    }

    for entry in WalkDir::new(skills_dir)
        .min_depth(1)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let depth = entry.depth();
        let is_top_level_md = depth == 1
            && path
                .extension()
                .map(|ext| ext == "md")
                .unwrap_or(false);
        let is_nested_skill = depth == 2
            && path
                .file_name()
                .map(|f| f == "SKILL.md")
                .unwrap_or(false);
        if !is_top_level_md && !is_nested_skill {
            continue;
        }

        let name = if is_nested_skill {
            path.parent()
                .and_then(|p| p.file_name())
                .map(|f| f.to_string_lossy().to_string())
        } else {
            path.file_stem().map(|f| f.to_string_lossy().to_string())
        };
        let Some(name) = name else { continue };

        match std::fs::read_to_string(path) {
            Ok(content) if !content.trim().is_empty() => skills.push(Skill {
                name,
                content: content.trim().to_string(),
            }),
            Ok(_) => {}
            Err(e) => log::warn!("[WORKSPACE] Failed to read skill {}: {}", path.display(), e),
        }
    }
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}
