//! Domain AST and compiler to the server's polish-notation leaf sequence
//! (spec §4.2, §6).
use serde_json::Value as Json;

/// Field-lookup operator suffix (spec §4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    Exact,
    Iexact,
    Contains,
    Icontains,
    Startswith,
    Istartswith,
    Endswith,
    Iendswith,
    Like,
    Ilike,
    Regex,
    Iregex,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Isnull,
}

impl Lookup {
    /// Parses a `field__op` spelling; `exact` when no suffix is present.
    pub fn parse_field_path(spelling: &str) -> (String, Lookup) {
        let known = [
            ("exact", Lookup::Exact),
            ("iexact", Lookup::Iexact),
            ("icontains", Lookup::Icontains),
            ("contains", Lookup::Contains),
            ("istartswith", Lookup::Istartswith),
            ("startswith", Lookup::Startswith),
            ("iendswith", Lookup::Iendswith),
            ("endswith", Lookup::Endswith),
            ("ilike", Lookup::Ilike),
            ("like", Lookup::Like),
            ("iregex", Lookup::Iregex),
            ("regex", Lookup::Regex),
            ("gte", Lookup::Gte),
            ("gt", Lookup::Gt),
            ("lte", Lookup::Lte),
            ("lt", Lookup::Lt),
            ("not_in", Lookup::NotIn),
            ("in", Lookup::In),
            ("isnull", Lookup::Isnull),
        ];
        for (suffix, lookup) in known {
            if let Some(field) = spelling.strip_suffix(&format!("__{suffix}")) {
                return (field.to_string(), lookup);
            }
        }
        (spelling.to_string(), Lookup::Exact)
    }

    /// Server-side operator token for a leaf triple.
    fn server_operator(self) -> &'static str {
        match self {
            Lookup::Exact => "=",
            Lookup::Iexact => "=ilike",
            Lookup::Contains => "like",
            Lookup::Icontains => "ilike",
            Lookup::Startswith => "=like",
            Lookup::Istartswith => "=ilike",
            Lookup::Endswith => "like",
            Lookup::Iendswith => "ilike",
            Lookup::Like => "like",
            Lookup::Ilike => "ilike",
            Lookup::Regex => "=~",
            Lookup::Iregex => "=~*",
            Lookup::Gt => ">",
            Lookup::Gte => ">=",
            Lookup::Lt => "<",
            Lookup::Lte => "<=",
            Lookup::In => "in",
            Lookup::NotIn => "not in",
            // `isnull` isn't a fixed operator: the caller's boolean picks
            // `=` (is null) or `!=` (is not null) in `Leaf::to_wire`.
            Lookup::Isnull => "=",
        }
    }
}

/// A leaf: `(field-path, operator, value)` (spec §3).
#[derive(Clone, Debug, PartialEq)]
pub struct Leaf {
    pub field_path: String,
    pub lookup: Lookup,
    pub value: Json,
}

impl Leaf {
    pub fn new(field_path: impl Into<String>, lookup: Lookup, value: Json) -> Self {
        Self {
            field_path: field_path.into(),
            lookup,
            value,
        }
    }

    fn to_wire(&self) -> Json {
        if let Lookup::Isnull = self.lookup {
            // `isnull=true` -> field = false (is null); `isnull=false` -> field != false.
            let operator = if self.value.as_bool().unwrap_or(true) { "=" } else { "!=" };
            return Json::Array(vec![Json::String(self.field_path.clone()), Json::String(operator.to_string()), Json::Bool(false)]);
        }
        let value = match self.lookup {
            Lookup::Startswith | Lookup::Istartswith => pattern_suffix(&self.value, "%", false),
            Lookup::Endswith | Lookup::Iendswith => pattern_suffix(&self.value, "%", true),
            Lookup::Contains | Lookup::Icontains => pattern_wrap(&self.value),
            _ => self.value.clone(),
        };
        Json::Array(vec![Json::String(self.field_path.clone()), Json::String(self.lookup.server_operator().to_string()), value])
    }
}

fn pattern_suffix(value: &Json, wildcard: &str, prefix: bool) -> Json {
    match value.as_str() {
        Some(s) if prefix => Json::String(format!("{wildcard}{s}")),
        Some(s) => Json::String(format!("{s}{wildcard}")),
        None => value.clone(),
    }
}

fn pattern_wrap(value: &Json) -> Json {
    match value.as_str() {
        Some(s) => Json::String(format!("%{s}%")),
        None => value.clone(),
    }
}

/// The domain AST: leaves and connectives, nested freely (spec §3).
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Leaf(Leaf),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    pub fn and(self, other: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(other))
    }

    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    /// Conjoins a sequence of leaves/expressions left-to-right, the same
    /// greedy left-grouping the compiler itself uses for implicit ANDs.
    pub fn all(exprs: Vec<Expr>) -> Option<Expr> {
        let mut it = exprs.into_iter();
        let first = it.next()?;
        Some(it.fold(first, |acc, e| acc.and(e)))
    }

    /// Flattens this AST into the server's polish-notation sequence:
    /// `&`/`|` prefix tokens, `!` unary negation, leaves as triples
    /// (spec §4.2 compilation step 1).
    pub fn compile(&self) -> Vec<Json> {
        let mut out = vec![];
        self.emit(&mut out);
        out
    }

    fn emit(&self, out: &mut Vec<Json>) {
        match self {
            Expr::Leaf(leaf) => out.push(leaf.to_wire()),
            Expr::And(a, b) => {
                out.push(Json::String("&".to_string()));
                a.emit(out);
                b.emit(out);
            }
            Expr::Or(a, b) => {
                out.push(Json::String("|".to_string()));
                a.emit(out);
                b.emit(out);
            }
            Expr::Not(a) => {
                out.push(Json::String("!".to_string()));
                a.emit(out);
            }
        }
    }
}

/// Compiles a top-level set of positional expressions and kwarg leaves into
/// the wire domain (spec §4.2: positional expressions AND-joined left to
/// right, kwargs appended after).
pub fn compile_domain(positional: Vec<Expr>, kwargs: Vec<Leaf>) -> Vec<Json> {
    let mut all_terms: Vec<Expr> = positional;
    all_terms.extend(kwargs.into_iter().map(Expr::Leaf));
    match Expr::all(all_terms) {
        Some(expr) => expr.compile(),
        None => vec![],
    }
}
