use crate::cancel::CancellationToken;
use crate::error::RagError;
use crate::generation::Prompt;
use crate::models::RetrievalResult;
use crate::orchestrator::RagOrchestrator;
use crate::repository::RepoLocation;
use crate::store::VectorStore;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const PAGE_CONTEXT_EXCERPTS: usize = 15;
const STRUCTURE_CONTEXT_EXCERPTS: usize = 20;
const INDEX_FILE: &str = "README.md";

const WRITER_SYSTEM_PROMPT: &str = "You are an expert technical writer and software architect. \
You document software projects strictly from the source excerpts you are given.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WikiDepth {
    #[default]
    Comprehensive,
    Concise,
}

impl WikiDepth {
    fn page_range(self) -> &'static str {
        match self {
            Self::Comprehensive => "8-12",
            Self::Concise => "4-6",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    High,
    Medium,
    Low,
}

impl Importance {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WikiPage {
    pub id: String,
    pub title: String,
    pub description: String,
    pub importance: Importance,
    pub file_paths: Vec<String>,
    pub related_pages: Vec<String>,
    pub parent_section: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WikiSection {
    pub id: String,
    pub title: String,
    pub pages: Vec<String>,
    pub subsections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WikiStructure {
    pub title: String,
    pub description: String,
    pub pages: Vec<WikiPage>,
    pub sections: Vec<WikiSection>,
    /// Sections no other section lists as a subsection.
    pub root_sections: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WikiRequest {
    pub depth: WikiDepth,
    pub output_dir: PathBuf,
    pub cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WikiReport {
    pub title: String,
    pub index: PathBuf,
    pub pages_written: Vec<PathBuf>,
    /// Titles of pages whose generation came back empty.
    pub skipped: Vec<String>,
}

pub struct WikiGenerator<'a> {
    orchestrator: &'a RagOrchestrator,
    store: &'a VectorStore,
    location: &'a RepoLocation,
}

impl<'a> WikiGenerator<'a> {
    pub fn new(orchestrator: &'a RagOrchestrator, store: &'a VectorStore, location: &'a RepoLocation) -> Self {
        Self {
            orchestrator,
            store,
            location,
        }
    }

    /// Plans the wiki, writes one Markdown file per page and a `README.md` index.
    pub async fn generate(&self, readme: Option<&str>, request: &WikiRequest) -> Result<WikiReport, RagError> {
        let cancel = request.cancel.as_ref();
        let structure = self.plan(request.depth, readme, cancel).await?;
        info!(title = %structure.title, pages = structure.pages.len(), "wiki structure planned");

        tokio::fs::create_dir_all(&request.output_dir).await?;
        let mut used_names = HashSet::new();
        let mut written: Vec<(&WikiPage, String)> = Vec::new();
        let mut skipped = Vec::new();

        for (position, page) in structure.pages.iter().enumerate() {
            info!(page = %page.title, position = position + 1, total = structure.pages.len(), "generating wiki page");
            let content = self.page_content(page, cancel).await?;
            if content.is_empty() {
                warn!(page = %page.title, "empty page content, skipping");
                skipped.push(page.title.clone());
                continue;
            }

            let file_name = unique_file_name(&mut used_names, page);
            tokio::fs::write(request.output_dir.join(&file_name), content).await?;
            written.push((page, file_name));
        }

        let index = request.output_dir.join(INDEX_FILE);
        tokio::fs::write(&index, render_index(&structure, &written)).await?;

        Ok(WikiReport {
            title: structure.title.clone(),
            index,
            pages_written: written
                .iter()
                .map(|(_, file_name)| request.output_dir.join(file_name))
                .collect(),
            skipped,
        })
    }

    pub async fn plan(
        &self,
        depth: WikiDepth,
        readme: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> Result<WikiStructure, RagError> {
        let query = format!(
            "{} overview: architecture, main components, entry points and configuration",
            self.location.name()
        );
        let excerpts = self
            .orchestrator
            .retrieve_top(self.store, &query, STRUCTURE_CONTEXT_EXCERPTS, cancel)
            .await?;

        let prompt = Prompt {
            system: WRITER_SYSTEM_PROMPT.to_string(),
            user: wrap_task(&group_by_file(&excerpts), &self.structure_task(depth, readme)),
        };
        let reply = self.orchestrator.complete(&prompt, cancel).await?;
        parse_wiki_structure(&reply)
    }

    pub fn structure_task(&self, depth: WikiDepth, readme: Option<&str>) -> String {
        let file_tree = self
            .store
            .documents()
            .iter()
            .map(|document| document.path.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let mut task = format!(
            "Plan a wiki for the repository {}.\n\n<file_tree>\n{file_tree}\n</file_tree>\n\n<readme>\n{}\n</readme>\n\n",
            self.location.name(),
            readme.unwrap_or_default()
        );
        task.push_str(&format!(
            "Create {} pages for a {} wiki. Each page covers one aspect of the codebase such as \
architecture, a key feature, data flow or setup. Prefer topics that benefit from diagrams. \
List actual repository files under relevant_files.\n\n",
            depth.page_range(),
            match depth {
                WikiDepth::Comprehensive => "comprehensive",
                WikiDepth::Concise => "concise",
            }
        ));
        task.push_str("Reply with XML only, no code fences and no surrounding text, in this shape:\n\n");
        task.push_str("<wiki_structure>\n  <title>Wiki title</title>\n  <description>One paragraph</description>\n");
        if depth == WikiDepth::Comprehensive {
            task.push_str(
                "  <sections>\n    <section id=\"section-1\">\n      <title>Section title</title>\n      \
<pages><page_ref>page-1</page_ref></pages>\n      \
<subsections><section_ref>section-2</section_ref></subsections>\n    </section>\n  </sections>\n",
            );
        }
        task.push_str(
            "  <pages>\n    <page id=\"page-1\">\n      <title>Page title</title>\n      \
<description>What the page covers</description>\n      <importance>high|medium|low</importance>\n      \
<relevant_files><file_path>src/main.rs</file_path></relevant_files>\n      \
<related_pages><related>page-2</related></related_pages>\n",
        );
        if depth == WikiDepth::Comprehensive {
            task.push_str("      <parent_section>section-1</parent_section>\n");
        }
        task.push_str("    </page>\n  </pages>\n</wiki_structure>");
        task
    }

    pub fn page_task(&self, page: &WikiPage) -> String {
        let file_links = page
            .file_paths
            .iter()
            .map(|path| format!("- [{path}]({})", self.location.file_url(path)))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Write a technical wiki page in Markdown about \"{title}\". {description}\n\n\
Start the page with exactly this block and nothing before it:\n\n\
<details>\n<summary>Relevant source files</summary>\n\n{file_links}\n</details>\n\n\
Follow it with the heading `# {title}`. Then write a short introduction, sections with `##` and `###` \
headings explaining the architecture, data flow and key types, Mermaid diagrams using `graph TD` or \
`sequenceDiagram`, and tables for configuration or data model fields where the excerpts support them. \
Cite sources after each paragraph as `Sources: [path:start-end]()`. \
Use only what the context shows; say so when something is missing.",
            title = page.title,
            description = page.description,
        )
    }

    async fn page_content(&self, page: &WikiPage, cancel: Option<&CancellationToken>) -> Result<String, RagError> {
        let query = format!("{} {} {}", page.title, page.description, page.file_paths.join(" "));
        let excerpts = self
            .orchestrator
            .retrieve_top(self.store, query.trim(), PAGE_CONTEXT_EXCERPTS, cancel)
            .await?;
        let context = excerpts
            .iter()
            .map(|excerpt| format!("File: {}\n{}", excerpt.chunk_ref.path, excerpt.text))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");

        let prompt = Prompt {
            system: WRITER_SYSTEM_PROMPT.to_string(),
            user: wrap_task(&context, &self.page_task(page)),
        };
        let reply = self.orchestrator.complete(&prompt, cancel).await?;
        Ok(strip_markdown_fence(&reply))
    }
}

fn wrap_task(context: &str, task: &str) -> String {
    format!("<context>\n{context}\n</context>\n\n<task>\n{task}\n</task>")
}

fn group_by_file(excerpts: &[RetrievalResult]) -> String {
    let mut by_path: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for excerpt in excerpts {
        by_path
            .entry(excerpt.chunk_ref.path.as_str())
            .or_default()
            .push(excerpt.text.as_str());
    }
    by_path
        .into_iter()
        .map(|(path, texts)| format!("## File Path: {path}\n\n{}", texts.join("\n\n")))
        .collect::<Vec<_>>()
        .join("\n\n----------\n\n")
}

/// Removes a wrapping ```` ```markdown ```` fence; fences inside the page are kept.
fn strip_markdown_fence(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(rest) = trimmed
        .strip_prefix("```markdown")
        .or_else(|| trimmed.strip_prefix("```md"))
        .or_else(|| trimmed.strip_prefix("```\n"))
    else {
        return trimmed.to_string();
    };
    rest.strip_suffix("```").unwrap_or(rest).trim().to_string()
}

/// Keeps ASCII letters, digits, spaces, `-` and `_`; spaces become underscores.
pub fn page_file_name(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|character| character.is_ascii_alphanumeric() || matches!(character, ' ' | '-' | '_'))
        .collect();
    kept.trim().replace(' ', "_")
}

fn unique_file_name(used: &mut HashSet<String>, page: &WikiPage) -> String {
    let mut stem = page_file_name(&page.title);
    if stem.is_empty() {
        stem = page_file_name(&page.id);
    }
    let mut candidate = format!("{stem}.md");
    let mut suffix = 2;
    while candidate == INDEX_FILE || !used.insert(candidate.clone()) {
        candidate = format!("{stem}-{suffix}.md");
        suffix += 1;
    }
    candidate
}

fn render_index(structure: &WikiStructure, written: &[(&WikiPage, String)]) -> String {
    let mut index = format!("# {}\n\n{}\n\n## Pages\n\n", structure.title, structure.description);
    for (page, file_name) in written {
        index.push_str(&format!("- [{}](./{file_name})\n", page.title));
    }
    index
}

#[derive(Default)]
struct SectionDraft {
    id: Option<String>,
    title: String,
    pages: Vec<String>,
    subsections: Vec<String>,
}

#[derive(Default)]
struct PageDraft {
    id: Option<String>,
    title: String,
    description: String,
    importance: String,
    file_paths: Vec<String>,
    related_pages: Vec<String>,
    parent_section: Option<String>,
}

/// Reads the `<wiki_structure>` element out of a model reply.
pub fn parse_wiki_structure(raw: &str) -> Result<WikiStructure, RagError> {
    let control = Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]")?;
    let element = Regex::new(r"<wiki_structure>[\s\S]*?</wiki_structure>")?;

    let cleaned = control.replace_all(raw, "");
    let xml = element
        .find(&cleaned)
        .map(|found| found.as_str())
        .ok_or_else(|| RagError::Input("reply contains no <wiki_structure> element".to_string()))?;

    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut title = String::new();
    let mut description = String::new();
    let mut pages: Vec<WikiPage> = Vec::new();
    let mut sections: Vec<WikiSection> = Vec::new();
    let mut page: Option<PageDraft> = None;
    let mut section: Option<SectionDraft> = None;

    loop {
        let text = match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = element_name(&start);
                match name.as_str() {
                    "page" => {
                        page = Some(PageDraft {
                            id: id_attribute(&start),
                            ..PageDraft::default()
                        })
                    }
                    "section" => {
                        section = Some(SectionDraft {
                            id: id_attribute(&start),
                            ..SectionDraft::default()
                        })
                    }
                    _ => {}
                }
                stack.push(name);
                continue;
            }
            Ok(Event::End(_)) => {
                match stack.pop().as_deref() {
                    Some("page") => {
                        if let Some(draft) = page.take() {
                            pages.push(finish_page(draft, pages.len() + 1));
                        }
                    }
                    Some("section") => {
                        if let Some(draft) = section.take() {
                            sections.push(finish_section(draft, sections.len() + 1));
                        }
                    }
                    _ => {}
                }
                continue;
            }
            Ok(Event::Text(text)) => text.unescape().unwrap_or_default().into_owned(),
            Ok(Event::CData(data)) => String::from_utf8_lossy(&data).into_owned(),
            Ok(Event::Eof) => break,
            Ok(_) => continue,
            Err(error) => return Err(RagError::Input(format!("malformed wiki structure: {error}"))),
        };

        let text = text.trim().to_string();
        let current = stack.last().map(String::as_str).unwrap_or_default();
        if let Some(draft) = page.as_mut() {
            match current {
                "title" => draft.title.push_str(&text),
                "description" => draft.description.push_str(&text),
                "importance" => draft.importance = text,
                "file_path" => draft.file_paths.push(text),
                "related" => draft.related_pages.push(text),
                "parent_section" => draft.parent_section = Some(text),
                _ => {}
            }
        } else if let Some(draft) = section.as_mut() {
            match current {
                "title" => draft.title.push_str(&text),
                "page_ref" => draft.pages.push(text),
                "section_ref" => draft.subsections.push(text),
                _ => {}
            }
        } else if stack.len() == 2 {
            match current {
                "title" => title.push_str(&text),
                "description" => description.push_str(&text),
                _ => {}
            }
        }
    }

    if pages.is_empty() {
        return Err(RagError::Input("wiki structure lists no pages".to_string()));
    }

    let referenced: HashSet<&str> = sections
        .iter()
        .flat_map(|section| section.subsections.iter().map(String::as_str))
        .collect();
    let root_sections = sections
        .iter()
        .filter(|section| !referenced.contains(section.id.as_str()))
        .map(|section| section.id.clone())
        .collect();

    Ok(WikiStructure {
        title,
        description,
        pages,
        sections,
        root_sections,
    })
}

fn element_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}

fn id_attribute(start: &BytesStart<'_>) -> Option<String> {
    start
        .attributes()
        .flatten()
        .find(|attribute| attribute.key.as_ref() == b"id")
        .and_then(|attribute| attribute.unescape_value().ok().map(|value| value.trim().to_string()))
        .filter(|value| !value.is_empty())
}

fn finish_page(draft: PageDraft, number: usize) -> WikiPage {
    WikiPage {
        id: draft.id.unwrap_or_else(|| format!("page-{number}")),
        title: draft.title,
        description: draft.description,
        importance: Importance::parse(&draft.importance),
        file_paths: draft.file_paths.into_iter().filter(|path| !path.is_empty()).collect(),
        related_pages: draft.related_pages.into_iter().filter(|id| !id.is_empty()).collect(),
        parent_section: draft.parent_section.filter(|id| !id.is_empty()),
    }
}

fn finish_section(draft: SectionDraft, number: usize) -> WikiSection {
    WikiSection {
        id: draft.id.unwrap_or_else(|| format!("section-{number}")),
        title: draft.title,
        pages: draft.pages.into_iter().filter(|id| !id.is_empty()).collect(),
        subsections: draft.subsections.into_iter().filter(|id| !id.is_empty()).collect(),
    }
}

/// Directory a wiki for `location` is written to when the caller gives none.
pub fn default_output_dir(base: &Path, location: &RepoLocation) -> PathBuf {
    base.join(format!("{}-wiki", page_file_name(&location.name())))
}
