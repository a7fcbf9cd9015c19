//! Query builder (spec §4.2, component F): domain AST, field lookups, and
//! the lazy, immutable `QuerySet`.
pub mod domain;
pub mod queryset;

pub use domain::{compile_domain, Expr, Leaf, Lookup};
pub use queryset::{OrderTerm, PageCursor, QuerySet, SortDirection};
