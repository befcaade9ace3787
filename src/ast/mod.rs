// src/ast/mod.rs
//! Abstract Syntax Tree contract consumed by the compiler
//!
//! The tree is produced by an external parser; its node shapes are a fixed
//! contract. Constructors below exist so parsers (and tests) can assemble
//! trees without spelling out every field.

use serde::{Deserialize, Serialize};

/// A template body: the `program` node of the contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Template {
    pub body: Vec<Node>,
    /// Names bound by the enclosing block helper (`as |a b|`).
    #[serde(default)]
    pub block_params: Vec<String>,
}

impl Template {
    pub fn new(body: Vec<Node>) -> Self {
        Self {
            body,
            block_params: Vec::new(),
        }
    }

    pub fn with_block_params(mut self, params: Vec<String>) -> Self {
        self.block_params = params;
        self
    }
}

/// Statement-level nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    /// Literal template text.
    Content(String),

    /// `{{! ... }}` — compiles to nothing.
    Comment(String),

    /// `{{expr}}` / `{{{expr}}}` / `{{*decorator}}`
    Mustache {
        sexpr: SubExpr,
        escaped: bool,
        decorator: bool,
    },

    /// `{{#expr}}...{{else}}...{{/expr}}` / `{{#*decorator}}...{{/decorator}}`
    Block {
        sexpr: SubExpr,
        program: Option<Template>,
        inverse: Option<Template>,
        decorator: bool,
    },

    /// `{{> name context key=value}}`
    Partial {
        name: PartialName,
        context: Option<Expr>,
        hash: Option<HashNode>,
        indent: String,
    },
}

impl Node {
    pub fn content(text: impl Into<String>) -> Self {
        Node::Content(text.into())
    }

    pub fn mustache(sexpr: SubExpr) -> Self {
        Node::Mustache {
            sexpr,
            escaped: true,
            decorator: false,
        }
    }

    pub fn unescaped(sexpr: SubExpr) -> Self {
        Node::Mustache {
            sexpr,
            escaped: false,
            decorator: false,
        }
    }

    pub fn decorator(sexpr: SubExpr) -> Self {
        Node::Mustache {
            sexpr,
            escaped: false,
            decorator: true,
        }
    }

    pub fn block(sexpr: SubExpr, program: Option<Template>, inverse: Option<Template>) -> Self {
        Node::Block {
            sexpr,
            program,
            inverse,
            decorator: false,
        }
    }

    pub fn decorator_block(sexpr: SubExpr, program: Template) -> Self {
        Node::Block {
            sexpr,
            program: Some(program),
            inverse: None,
            decorator: true,
        }
    }

    pub fn partial(name: impl Into<String>) -> Self {
        Node::Partial {
            name: PartialName::Static(name.into()),
            context: None,
            hash: None,
            indent: String::new(),
        }
    }
}

/// Call-like expression: a path plus optional params and hash.
///
/// Both mustaches and blocks carry one of these; a bare `{{name}}` is a
/// `SubExpr` with no params and no hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubExpr {
    pub path: Expr,
    pub params: Vec<Expr>,
    pub hash: Option<HashNode>,
}

impl SubExpr {
    pub fn new(path: Expr) -> Self {
        Self {
            path,
            params: Vec::new(),
            hash: None,
        }
    }

    pub fn helper(name: impl Into<String>, params: Vec<Expr>) -> Self {
        Self {
            path: Expr::path(&[&name.into()]),
            params,
            hash: None,
        }
    }

    pub fn with_hash(mut self, hash: HashNode) -> Self {
        self.hash = Some(hash);
        self
    }

    /// True when params or a hash force helper semantics.
    pub fn is_helper_call(&self) -> bool {
        !self.params.is_empty() || self.hash.is_some()
    }

    /// The path component, when it is one.
    pub fn path_expr(&self) -> Option<&PathExpr> {
        match &self.path {
            Expr::Path(p) => Some(p),
            _ => None,
        }
    }
}

/// Expression-level nodes: paths, literals and nested sub-expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Path(PathExpr),
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
    Undefined,
    SubExpr(Box<SubExpr>),
}

impl Expr {
    /// Plain context path, e.g. `&["user", "name"]` for `user.name`.
    pub fn path(parts: &[&str]) -> Self {
        Expr::Path(PathExpr::new(parts, 0))
    }

    /// `../`-prefixed path reaching `depth` ancestors out.
    pub fn parent_path(parts: &[&str], depth: usize) -> Self {
        Expr::Path(PathExpr::new(parts, depth))
    }

    /// `@`-prefixed data path, e.g. `@index`.
    pub fn data_path(parts: &[&str]) -> Self {
        let mut path = PathExpr::new(parts, 0);
        path.data = true;
        path.original = format!("@{}", parts.join("."));
        Expr::Path(path)
    }

    /// Bare `this` / `.`.
    pub fn this() -> Self {
        Expr::Path(PathExpr {
            parts: Vec::new(),
            depth: 0,
            data: false,
            falsy: false,
            scoped: true,
            original: "this".to_string(),
        })
    }

    pub fn sub(sexpr: SubExpr) -> Self {
        Expr::SubExpr(Box::new(sexpr))
    }
}

/// `path{parts, depth, falsy, isScoped}` of the contract, plus the original
/// source text (helper and decorator names are reported with it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PathExpr {
    pub parts: Vec<String>,
    pub depth: usize,
    /// `@`-prefixed data reference.
    #[serde(default)]
    pub data: bool,
    /// Falsy intermediates short-circuit the walk to null.
    #[serde(default)]
    pub falsy: bool,
    /// `this.x` / `./x` — never eligible for helper resolution.
    #[serde(default)]
    pub scoped: bool,
    #[serde(default)]
    pub original: String,
}

impl PathExpr {
    pub fn new(parts: &[&str], depth: usize) -> Self {
        let parts: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
        let mut original = parts.join(".");
        for _ in 0..depth {
            original = format!("../{}", original);
        }
        Self {
            parts,
            depth,
            data: false,
            falsy: false,
            scoped: false,
            original,
        }
    }

    /// A single-segment, current-depth, non-data, non-scoped identifier: the
    /// only shape eligible for helper or block-param resolution.
    pub fn is_simple_id(&self) -> bool {
        self.parts.len() == 1 && !self.data && self.depth == 0 && !self.scoped
    }

    /// First segment, empty for bare `this`.
    pub fn head(&self) -> &str {
        self.parts.first().map(String::as_str).unwrap_or("")
    }
}

/// `hash{pairs}` node: ordered key/value pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HashNode {
    pub pairs: Vec<(String, Expr)>,
}

impl HashNode {
    pub fn new(pairs: Vec<(&str, Expr)>) -> Self {
        Self {
            pairs: pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }
}

/// Partial names are either static or computed by a sub-expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartialName {
    Static(String),
    Dynamic(Box<SubExpr>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_id_detection() {
        assert!(PathExpr::new(&["name"], 0).is_simple_id());
        assert!(!PathExpr::new(&["a", "b"], 0).is_simple_id());
        assert!(!PathExpr::new(&["name"], 1).is_simple_id());

        let mut data = PathExpr::new(&["index"], 0);
        data.data = true;
        assert!(!data.is_simple_id());
    }

    #[test]
    fn test_original_reconstruction() {
        assert_eq!(PathExpr::new(&["a", "b"], 0).original, "a.b");
        assert_eq!(PathExpr::new(&["x"], 2).original, "../../x");
    }

    #[test]
    fn test_ast_serialization_round_trip() {
        let node = Node::mustache(SubExpr::new(Expr::path(&["user", "name"])));
        let json = serde_json::to_string(&node).unwrap();
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(node, back);
    }
}
