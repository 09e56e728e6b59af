//! Pluggable language parsers keyed by file extension.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tree_sitter::{Parser, Tree};

use crate::error::{IndexError, Result};
use crate::languages::{Lang, extension_of};

/// Turns source text into a syntax tree for one language.
///
/// Implementations are stateless; the same instance is shared by all workers.
pub trait LanguageParser: Send + Sync {
    fn language(&self) -> Lang;

    /// Whether this parser handles files with extension `ext` (no dot, lowercase).
    fn can_parse(&self, ext: &str) -> bool;

    /// # Errors
    ///
    /// Returns [`IndexError::Parse`] if the grammar cannot be loaded or parsing aborts.
    fn parse(&self, source: &str) -> Result<Tree>;
}

/// Tree-sitter backed parser. A fresh [`Parser`] is created per call, so no
/// parser state is shared between workers.
pub struct TreeSitterParser {
    lang: Lang,
    grammar: tree_sitter::Language,
}

impl TreeSitterParser {
    /// Returns `None` when the grammar for `lang` is compiled out.
    #[must_use]
    pub fn new(lang: Lang) -> Option<Self> {
        lang.grammar().map(|grammar| Self { lang, grammar })
    }
}

impl LanguageParser for TreeSitterParser {
    fn language(&self) -> Lang {
        self.lang
    }

    fn can_parse(&self, ext: &str) -> bool {
        self.lang.extensions().contains(&ext)
    }

    fn parse(&self, source: &str) -> Result<Tree> {
        let mut parser = Parser::new();
        parser
            .set_language(&self.grammar)
            .map_err(|e| IndexError::Parse(format!("set_language failed: {e}")))?;
        parser
            .parse(source, None)
            .ok_or_else(|| IndexError::Parse(format!("{} parser returned no tree", self.lang)))
    }
}

/// Extension → parser lookup table.
#[derive(Default, Clone)]
pub struct ParserRegistry {
    by_ext: HashMap<String, Arc<dyn LanguageParser>>,
}

impl std::fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut exts: Vec<_> = self.by_ext.keys().collect();
        exts.sort();
        f.debug_struct("ParserRegistry")
            .field("extensions", &exts)
            .finish()
    }
}

impl ParserRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with a tree-sitter parser for every compiled-in grammar.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        for lang in Lang::ALL {
            if let Some(parser) = TreeSitterParser::new(lang) {
                registry.register(Arc::new(parser));
            }
        }
        registry
    }

    /// Register `parser` for every extension of its language it accepts.
    /// A later registration replaces an earlier one for the same extension.
    pub fn register(&mut self, parser: Arc<dyn LanguageParser>) {
        for ext in parser.language().extensions() {
            if parser.can_parse(ext) {
                self.by_ext.insert((*ext).to_owned(), Arc::clone(&parser));
            }
        }
    }

    #[must_use]
    pub fn for_extension(&self, ext: &str) -> Option<Arc<dyn LanguageParser>> {
        self.by_ext.get(&ext.to_ascii_lowercase()).cloned()
    }

    #[must_use]
    pub fn for_path(&self, path: &Path) -> Option<Arc<dyn LanguageParser>> {
        extension_of(path).and_then(|ext| self.for_extension(&ext))
    }

    #[must_use]
    pub fn supports(&self, path: &Path) -> bool {
        self.for_path(path).is_some()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_ext.is_empty()
    }
}
