//! Dependency-walk ordering over analyzed graphs.

mod common;

use braid::{Singleton, SingletonContext, VariantId};
use common::{analyze, register_test_types, test_ctx};
use std::sync::{Arc, Mutex};

/// Walks from `top`, recursing only into deps whose type is `follow_type`,
/// and records the down/up visit orders.
struct WalkRecorder {
    top: String,
    follow_type: String,
    allow_duplicates: bool,
    down: Arc<Mutex<String>>,
    up: Arc<Mutex<String>>,
}

impl Singleton for WalkRecorder {
    fn generate_build_actions(&mut self, ctx: &mut SingletonContext<'_>) {
        let mut top_id: Option<VariantId> = None;
        ctx.visit_all_modules(|id| {
            if ctx.module_name(id) == self.top {
                top_id = Some(id);
            }
        });
        let top = top_id.expect("top module exists");
        let mut down = String::new();
        let mut up = String::new();
        ctx.walk_deps(
            top,
            self.allow_duplicates,
            |dep, _parent| {
                down.push_str(&ctx.module_name(dep.target));
                ctx.module_type(dep.target) == self.follow_type
            },
            |id| up.push_str(&ctx.module_name(id)),
        );
        *self.down.lock().unwrap() = down;
        *self.up.lock().unwrap() = up;
    }
}

fn module(type_name: &str, name: &str, deps: &[&str]) -> String {
    let deps = deps.iter().map(|d| format!("{:?}", d)).collect::<Vec<_>>().join(", ");
    format!("{} {{ name: {:?}, deps: [{}] }}\n", type_name, name, deps)
}

#[test]
fn walk_deps_depth_first_order() {
    // A -> {B, C}; B -> {D}; C -> {E, F}; E -> {G}; F -> {G}. Recursion
    // follows only `foo`-typed modules: C and F.
    let mut braidfile = String::new();
    braidfile += &module("foo", "A", &["B", "C"]);
    braidfile += &module("bar", "B", &["D"]);
    braidfile += &module("foo", "C", &["E", "F"]);
    braidfile += &module("bar", "D", &[]);
    braidfile += &module("bar", "E", &["G"]);
    braidfile += &module("foo", "F", &["G"]);
    braidfile += &module("bar", "G", &[]);

    let mut ctx = test_ctx(&[("Braidfile.list", "Braidfile\n"), ("Braidfile", &braidfile)]);
    register_test_types(&mut ctx, &["foo", "bar"]);
    let down = Arc::new(Mutex::new(String::new()));
    let up = Arc::new(Mutex::new(String::new()));
    ctx.register_singleton(
        "walk",
        Box::new(WalkRecorder {
            top: "A".to_string(),
            follow_type: "foo".to_string(),
            allow_duplicates: false,
            down: down.clone(),
            up: up.clone(),
        }),
        false,
    );
    analyze(&mut ctx, "Braidfile.list");

    assert_eq!(*down.lock().unwrap(), "BCEFG");
    assert_eq!(*up.lock().unwrap(), "BEGFC");
}

#[test]
fn walk_deps_with_duplicate_edges() {
    // A -> {B, C}; C -> {E, F}; E -> {G}; F -> {G, G}; G -> {H}, walked
    // with duplicates allowed and recursion into everything.
    let mut braidfile = String::new();
    braidfile += &module("foo", "A", &["B", "C"]);
    braidfile += &module("foo", "B", &[]);
    braidfile += &module("foo", "C", &["E", "F"]);
    braidfile += &module("foo", "E", &["G"]);
    braidfile += &module("foo", "F", &["G", "G"]);
    braidfile += &module("foo", "G", &["H"]);
    braidfile += &module("foo", "H", &[]);

    let mut ctx = test_ctx(&[("Braidfile.list", "Braidfile\n"), ("Braidfile", &braidfile)]);
    register_test_types(&mut ctx, &["foo"]);
    let down = Arc::new(Mutex::new(String::new()));
    let up = Arc::new(Mutex::new(String::new()));
    ctx.register_singleton(
        "walk",
        Box::new(WalkRecorder {
            top: "A".to_string(),
            follow_type: "foo".to_string(),
            allow_duplicates: true,
            down: down.clone(),
            up: up.clone(),
        }),
        false,
    );
    analyze(&mut ctx, "Braidfile.list");

    assert_eq!(*down.lock().unwrap(), "BCEGHFGG");
    assert_eq!(*up.lock().unwrap(), "BHGEGGFC");
}
