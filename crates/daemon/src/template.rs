//! LaTeX template validation.
//!
//! Static analysis only: structure (braces, `\documentclass`, document body)
//! and dependency availability (class, packages, fonts, bibliography tools).
//! Structural problems and a missing class file fail validation; missing
//! packages, fonts and tools are reported but tolerated, since LaTeX may still
//! cope and the fallback chain drops the template anyway.
//!
//! Results are cached per template fingerprint so an unchanged template is
//! analysed once no matter how many jobs use it.

use crate::fingerprint::sha256_tagged;
use crate::toolchain::{DependencyIndex, Presence};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

static PACKAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\(?:usepackage|RequirePackage)\s*(?:\[[^\]]*\])?\s*\{([^}]+)\}")
        .expect("package regex")
});
static CLASS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\documentclass\s*(?:\[[^\]]*\])?\s*\{([^}]+)\}").expect("class regex")
});
static BIBSTYLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\bibliographystyle\s*\{([^}]+)\}").expect("bibstyle regex"));
static FONT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\set(?:main|sans|mono)font\s*(?:\[[^\]]*\])?\s*\{([^}]+)\}")
        .expect("font regex")
});

/// Template bytes captured at job admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSnapshot {
    pub path: PathBuf,
    pub bytes: Arc<Vec<u8>>,
    /// `sha256:<hex>` of `bytes`.
    pub fingerprint: String,
}

impl TemplateSnapshot {
    pub fn read(path: &Path) -> io::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self::from_bytes(path.to_path_buf(), bytes))
    }

    pub fn from_bytes(path: PathBuf, bytes: Vec<u8>) -> Self {
        let fingerprint = sha256_tagged(&bytes);
        Self {
            path,
            bytes: Arc::new(bytes),
            fingerprint,
        }
    }
}

/// What a template declares it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateRequirements {
    pub class_name: Option<String>,
    /// Deduplicated and sorted; option lists and comma lists are collapsed.
    pub packages: Vec<String>,
    pub fonts: Vec<String>,
    pub uses_fontspec: bool,
    pub uses_biblatex: bool,
    pub uses_bibtex_style: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub name: String,
    pub presence: Presence,
}

/// Outcome of validating one template version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub template_fingerprint: String,
    pub structural_errors: Vec<String>,
    pub used_class: Option<String>,
    pub class_presence: Option<Presence>,
    pub packages: Vec<DependencyStatus>,
    pub fonts: Vec<DependencyStatus>,
    /// Packages and helper binaries reported missing (non-fatal).
    pub missing_dependencies: Vec<String>,
    /// Font families reported missing (non-fatal).
    pub missing_fonts: Vec<String>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.hard_failures().is_empty()
    }

    /// Reasons that reject the template.
    pub fn hard_failures(&self) -> Vec<String> {
        let mut failures = self.structural_errors.clone();
        if self.class_presence == Some(Presence::Missing) {
            if let Some(class) = &self.used_class {
                failures.push(format!("class:{} (.cls not found)", class));
            }
        }
        failures
    }

    /// Multi-line dependency report written into each job log.
    pub fn render(&self) -> String {
        let mut out = String::from("[DEP] Template analysis:\n");
        let _ = writeln!(out, "  template: {}", self.template_fingerprint);
        if self.structural_errors.is_empty() {
            let _ = writeln!(out, "  syntax: ok");
        } else {
            let _ = writeln!(out, "  syntax: {}", self.structural_errors.join("; "));
        }
        let _ = writeln!(
            out,
            "  class: {}",
            self.used_class.as_deref().unwrap_or("-")
        );
        let packages: Vec<&str> = self.packages.iter().map(|p| p.name.as_str()).collect();
        let _ = writeln!(
            out,
            "  packages: {}",
            if packages.is_empty() {
                "-".to_string()
            } else {
                packages.join(", ")
            }
        );
        if !self.fonts.is_empty() {
            let fonts: Vec<&str> = self.fonts.iter().map(|f| f.name.as_str()).collect();
            let _ = writeln!(out, "  fonts: {}", fonts.join(", "));
        }
        let failures = self.hard_failures();
        if !failures.is_empty() {
            let _ = writeln!(out, "  FAILED:");
            for f in &failures {
                let _ = writeln!(out, "    - {}", f);
            }
        }
        if !self.missing_dependencies.is_empty() || !self.missing_fonts.is_empty() {
            let _ = writeln!(out, "  MISSING:");
            for m in &self.missing_dependencies {
                let _ = writeln!(out, "    - {}", m);
            }
            for f in &self.missing_fonts {
                let _ = writeln!(out, "    - font:{} (not found via fontconfig)", f);
            }
        }
        out
    }
}

/// Drop `%` comments, keeping escaped `\%`.
fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let mut escaped = false;
        for c in line.chars() {
            if c == '%' && !escaped {
                break;
            }
            escaped = c == '\\' && !escaped;
            out.push(c);
        }
        out.push('\n');
    }
    out
}

/// Structural problems in comment-stripped template text.
pub fn check_structure(text: &str) -> Vec<String> {
    let mut errors = Vec::new();

    let mut depth: i64 = 0;
    let mut went_negative = false;
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    went_negative = true;
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        errors.push(format!("Unbalanced braces (difference: {})", depth));
    } else if went_negative {
        errors.push("Closing brace without matching opening brace".to_string());
    }

    if !text.contains("\\documentclass") {
        errors.push("Missing \\documentclass".to_string());
    }
    if !text.contains("\\begin{document}") {
        errors.push("Missing \\begin{document}".to_string());
    }
    if !text.contains("\\end{document}") {
        errors.push("Missing \\end{document}".to_string());
    }

    errors
}

/// Enumerate the class, packages and fonts a template declares.
pub fn parse_requirements(text: &str) -> TemplateRequirements {
    let mut packages = BTreeSet::new();
    for cap in PACKAGE_RE.captures_iter(text) {
        for name in cap[1].split(',') {
            let name = name.trim();
            if !name.is_empty() {
                packages.insert(name.to_string());
            }
        }
    }

    let class_name = CLASS_RE
        .captures(text)
        .map(|cap| cap[1].trim().to_string())
        .filter(|c| !c.is_empty());

    let uses_fontspec = packages.iter().any(|p| p.eq_ignore_ascii_case("fontspec"));
    let uses_biblatex = packages.iter().any(|p| p.eq_ignore_ascii_case("biblatex"));

    let fonts: BTreeSet<String> = if uses_fontspec {
        FONT_RE
            .captures_iter(text)
            .map(|cap| cap[1].trim().to_string())
            .filter(|f| !f.is_empty())
            .collect()
    } else {
        BTreeSet::new()
    };

    TemplateRequirements {
        class_name,
        packages: packages.into_iter().collect(),
        fonts: fonts.into_iter().collect(),
        uses_fontspec,
        uses_biblatex,
        uses_bibtex_style: BIBSTYLE_RE.is_match(text),
    }
}

/// Validate template bytes against a dependency index.
pub fn validate(bytes: &[u8], index: &dyn DependencyIndex) -> ValidationReport {
    let template_fingerprint = sha256_tagged(bytes);

    let text = match std::str::from_utf8(bytes) {
        Ok(text) => strip_comments(text),
        Err(e) => {
            return ValidationReport {
                template_fingerprint,
                structural_errors: vec![format!("Template is not valid UTF-8: {}", e)],
                used_class: None,
                class_presence: None,
                packages: Vec::new(),
                fonts: Vec::new(),
                missing_dependencies: Vec::new(),
                missing_fonts: Vec::new(),
            };
        }
    };

    let structural_errors = check_structure(&text);
    let reqs = parse_requirements(&text);

    let class_presence = reqs
        .class_name
        .as_ref()
        .map(|class| index.tex_file(&format!("{}.cls", class)));

    let mut missing_dependencies = Vec::new();

    let packages: Vec<DependencyStatus> = reqs
        .packages
        .iter()
        .map(|name| {
            let presence = index.tex_file(&format!("{}.sty", name));
            if presence == Presence::Missing {
                missing_dependencies.push(format!("package:{} (.sty not found)", name));
            }
            DependencyStatus {
                name: name.clone(),
                presence,
            }
        })
        .collect();

    if reqs.uses_biblatex && index.binary("biber") == Presence::Missing {
        missing_dependencies.push("binary:biber required by biblatex".to_string());
    }
    if reqs.uses_bibtex_style && index.binary("bibtex") == Presence::Missing {
        missing_dependencies.push("binary:bibtex required by bibliographystyle".to_string());
    }
    if reqs.uses_fontspec
        && index.binary("xelatex") == Presence::Missing
        && index.binary("lualatex") == Presence::Missing
    {
        missing_dependencies.push("binary:xelatex or lualatex required by fontspec".to_string());
    }

    let fonts: Vec<DependencyStatus> = reqs
        .fonts
        .iter()
        .map(|family| DependencyStatus {
            name: family.clone(),
            presence: index.font(family),
        })
        .collect();
    let missing_fonts = fonts
        .iter()
        .filter(|f| f.presence == Presence::Missing)
        .map(|f| f.name.clone())
        .collect();

    ValidationReport {
        template_fingerprint,
        structural_errors,
        used_class: reqs.class_name,
        class_presence,
        packages,
        fonts,
        missing_dependencies,
        missing_fonts,
    }
}

/// Validates templates once per content fingerprint.
pub struct TemplateValidator {
    index: Arc<dyn DependencyIndex>,
    results: Mutex<HashMap<String, Arc<ValidationReport>>>,
}

impl TemplateValidator {
    pub fn new(index: Arc<dyn DependencyIndex>) -> Self {
        Self {
            index,
            results: Mutex::new(HashMap::new()),
        }
    }

    /// Validation result for a template snapshot, computed on first use.
    ///
    /// The lock is held across validation so concurrent jobs sharing a new
    /// template wait for one analysis instead of each running their own.
    pub async fn validate(&self, template: &TemplateSnapshot) -> Arc<ValidationReport> {
        let mut results = self.results.lock().await;
        if let Some(report) = results.get(&template.fingerprint) {
            debug!(template = %template.fingerprint, "template validation cache hit");
            return report.clone();
        }

        let index = self.index.clone();
        let bytes = template.bytes.clone();
        let report = match tokio::task::spawn_blocking(move || validate(&bytes, index.as_ref())).await {
            Ok(report) => report,
            Err(e) => {
                // Not cached: the next job retries the analysis.
                warn!(template = %template.path.display(), error = %e, "template validation task failed");
                return Arc::new(ValidationReport {
                    template_fingerprint: template.fingerprint.clone(),
                    structural_errors: vec![format!("validation task failed: {}", e)],
                    used_class: None,
                    class_presence: None,
                    packages: Vec::new(),
                    fonts: Vec::new(),
                    missing_dependencies: Vec::new(),
                    missing_fonts: Vec::new(),
                });
            }
        };

        for dep in &report.missing_dependencies {
            warn!(template = %template.path.display(), dependency = %dep, "template dependency missing");
        }
        for font in &report.missing_fonts {
            warn!(template = %template.path.display(), font = %font, "template font missing");
        }
        if report.class_presence == Some(Presence::Unknown) {
            warn!(template = %template.path.display(), "kpsewhich unavailable; document class not verified");
        }

        let report = Arc::new(report);
        results.insert(template.fingerprint.clone(), report.clone());
        report
    }

    /// Number of distinct template versions analysed so far.
    pub async fn cached_versions(&self) -> usize {
        self.results.lock().await.len()
    }
}
