//! Pre-analyzed documents and terms.
//!
//! Analysis is not part of Tessera: a [`Document`] arrives as named fields of
//! already-produced terms. [`DocumentBuilder::add_text`] is a convenience that
//! splits on whitespace, enough for tests and tooling.
//!
//! # Examples
//!
//! ```
//! use tessera::document::{Document, Term};
//!
//! let doc = Document::builder()
//!     .add_text("body", "the quick brown fox")
//!     .add_terms("id", ["42"])
//!     .build();
//!
//! assert_eq!(doc.len(), 2);
//! assert_eq!(doc.field("body").map(|f| f.terms.len()), Some(4));
//! assert_eq!(Term::new("id", "42").to_string(), "id:42");
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// A term: a field name and the text of one indexed token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub text: String,
}

impl Term {
    pub fn new<F: Into<String>, T: Into<String>>(field: F, text: T) -> Self {
        Term {
            field: field.into(),
            text: text.into(),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.text)
    }
}

/// One field of a document: its name and its terms in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub terms: Vec<String>,
}

/// A document to be indexed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    fields: Vec<Field>,
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        Document { fields: Vec::new() }
    }

    /// Append terms to field `name`, creating the field if needed.
    pub fn add_terms<S, I, T>(&mut self, name: S, terms: I)
    where
        S: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let name = name.into();
        let terms = terms.into_iter().map(Into::into);
        match self.fields.iter_mut().find(|field| field.name == name) {
            Some(field) => field.terms.extend(terms),
            None => self.fields.push(Field {
                name,
                terms: terms.collect(),
            }),
        }
    }

    /// Append the whitespace-separated words of `text` to field `name`.
    pub fn add_text<S: Into<String>>(&mut self, name: S, text: &str) {
        self.add_terms(name, text.split_whitespace());
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Get the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Create a builder for constructing documents.
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::new()
    }
}

/// A builder for constructing documents in a fluent manner.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    document: Document,
}

impl DocumentBuilder {
    pub fn new() -> Self {
        DocumentBuilder::default()
    }

    pub fn add_text<S: Into<String>>(mut self, name: S, text: &str) -> Self {
        self.document.add_text(name, text);
        self
    }

    pub fn add_terms<S, I, T>(mut self, name: S, terms: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.document.add_terms(name, terms);
        self
    }

    pub fn build(self) -> Document {
        self.document
    }
}
