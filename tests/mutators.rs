//! Mutator and transition behavior over full analyses.

mod common;

use braid::{
    new_mutator_provider, MutatorContext, ProviderKey, TransitionContext, TransitionInfo,
    TransitionInfoRef, TransitionMutator, VariationLabel,
};
use common::{analyze, manifest, register_test_types, test_ctx};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Linkage(String);

lazy_static! {
    static ref LINKAGE: ProviderKey<Linkage> = new_mutator_provider::<Linkage>("linkage");
    static ref ARCH: ProviderKey<Linkage> = new_mutator_provider::<Linkage>("arch_mutate");
}

fn linkage_mutator(mctx: &mut MutatorContext<'_>) {
    if mctx.module_type() != "mlib" {
        return;
    }
    let splits = mctx.create_variations(&["static", "shared"]);
    for (split, label) in splits.iter().zip(["static", "shared"]) {
        mctx.set_variation_provider(split, *LINKAGE, Linkage(label.to_string()));
    }
}

#[test]
fn create_variations_splits_and_rewires_edges() {
    let mut ctx = test_ctx(&[
        ("Braidfile.list", "Braidfile\n"),
        (
            "Braidfile",
            "mlib { name: \"mylib\" }\nt { name: \"prog\", deps: [\"mylib\"] }\n",
        ),
    ]);
    register_test_types(&mut ctx, &["mlib", "t"]);
    ctx.register_bottom_up_mutator("linkage", linkage_mutator);
    analyze(&mut ctx, "Braidfile.list");
    let text = manifest(&mut ctx);

    // The original is a tombstone; both clones generate.
    assert!(text.contains("build mylib.static.out"), "{}", text);
    assert!(text.contains("build mylib.shared.out"), "{}", text);
    assert_eq!(text.matches("Module:  mylib").count(), 2, "{}", text);
    // prog's edge was rewritten to the first clone.
    assert!(text.contains("build prog.out: phony mylib"), "{}", text);
}

#[test]
fn variation_providers_are_readable_downstream() {
    // A consumer singleton checks the provider landed on each clone.
    use braid::{Singleton, SingletonContext};
    use std::sync::Mutex;

    struct Check {
        seen: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl Singleton for Check {
        fn generate_build_actions(&mut self, ctx: &mut SingletonContext<'_>) {
            ctx.visit_all_module_variants("mylib", |id| {
                if let Some(linkage) = ctx.other_module_provider(id, *LINKAGE) {
                    self.seen
                        .lock()
                        .unwrap()
                        .push((ctx.module_variant(id), linkage.0.clone()));
                }
            });
        }
    }

    let mut ctx = test_ctx(&[
        ("Braidfile.list", "Braidfile\n"),
        ("Braidfile", "mlib { name: \"mylib\" }\n"),
    ]);
    register_test_types(&mut ctx, &["mlib"]);
    ctx.register_bottom_up_mutator("linkage", linkage_mutator);
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    ctx.register_singleton("check", Box::new(Check { seen: seen.clone() }), false);
    analyze(&mut ctx, "Braidfile.list");

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("shared".to_string(), "shared".to_string()),
            ("static".to_string(), "static".to_string()),
        ],
    );
}

#[test]
fn rename_changes_the_visible_name() {
    fn renamer(mctx: &mut MutatorContext<'_>) {
        if mctx.module_name() == "oldname" {
            mctx.rename("newname");
        }
    }

    let mut ctx = test_ctx(&[
        ("Braidfile.list", "Braidfile\n"),
        ("Braidfile", "t { name: \"oldname\" }\n"),
    ]);
    register_test_types(&mut ctx, &["t"]);
    ctx.register_bottom_up_mutator("renamer", renamer).uses_rename();
    analyze(&mut ctx, "Braidfile.list");
    let text = manifest(&mut ctx);
    assert!(text.contains("Module:  newname"), "{}", text);
    assert!(!text.contains("Module:  oldname"), "{}", text);
}

#[test]
fn reverse_dependencies_attach_after_the_pass() {
    fn attacher(mctx: &mut MutatorContext<'_>) {
        if mctx.module_type() == "plugin" {
            mctx.add_reverse_dependency(None, "host");
        }
    }

    let mut ctx = test_ctx(&[
        ("Braidfile.list", "Braidfile\n"),
        (
            "Braidfile",
            "t { name: \"host\" }\nplugin { name: \"plug_b\" }\nplugin { name: \"plug_a\" }\n",
        ),
    ]);
    register_test_types(&mut ctx, &["t", "plugin"]);
    ctx.register_bottom_up_mutator("attach", attacher).uses_reverse_dependencies();
    analyze(&mut ctx, "Braidfile.list");
    let text = manifest(&mut ctx);
    // host's build-def lists its (reverse-attached) deps as inputs, in
    // deterministic name order.
    assert!(text.contains("build host.out: phony plug_a plug_b"), "{}", text);
}

#[test]
fn added_dependencies_pause_until_processed() {
    // The adder module adds a dep on "late" during the mutator pass and
    // immediately reads a provider the same mutator set on it; the pause
    // guarantees "late" was processed first.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Marker(u32);

    lazy_static! {
        static ref MARKER: ProviderKey<Marker> = new_mutator_provider::<Marker>("adder");
    }

    fn adder(mctx: &mut MutatorContext<'_>) {
        match mctx.module_type().as_str() {
            "late" => mctx.set_provider(*MARKER, Marker(7)),
            "adder" => {
                let added = mctx.add_dependency(None, &["late"]);
                assert_eq!(added.len(), 1);
                let marker = mctx
                    .other_module_provider(added[0], *MARKER)
                    .expect("dep was processed before the pause released");
                assert_eq!(*marker, Marker(7));
            }
            _ => {}
        }
    }

    let mut ctx = test_ctx(&[
        ("Braidfile.list", "Braidfile\n"),
        ("Braidfile", "adder { name: \"early\" }\nlate { name: \"late\" }\n"),
    ]);
    register_test_types(&mut ctx, &["adder", "late"]);
    ctx.register_bottom_up_mutator("adder", adder);
    analyze(&mut ctx, "Braidfile.list");
    let text = manifest(&mut ctx);
    // The added edge shows up as an input of early's build-def.
    assert!(text.contains("build early.out: phony late"), "{}", text);
}

// ---- transitions -----------------------------------------------------------

/// Binaries split intrinsically into arm and x86; everything else splits
/// only as demanded by its dependents.
struct ArchTransition;

impl TransitionMutator for ArchTransition {
    fn split(&self, ctx: &TransitionContext<'_>) -> Vec<TransitionInfoRef> {
        if ctx.module_type() == "abin" {
            vec![
                Arc::new(VariationLabel("arm".to_string())),
                Arc::new(VariationLabel("x86".to_string())),
            ]
        } else {
            Vec::new()
        }
    }

    fn outgoing_transition(
        &self,
        _ctx: &TransitionContext<'_>,
        source_info: &TransitionInfoRef,
    ) -> TransitionInfoRef {
        source_info.clone()
    }

    fn incoming_transition(
        &self,
        _ctx: &TransitionContext<'_>,
        incoming: TransitionInfoRef,
    ) -> TransitionInfoRef {
        incoming
    }

    fn mutate(&self, ctx: &mut MutatorContext<'_>, info: TransitionInfoRef) {
        if !info.variation().is_empty() {
            ctx.set_provider(*ARCH, Linkage(info.variation()));
        }
    }

    fn transition_info_from_variation(&self, label: &str) -> TransitionInfoRef {
        Arc::new(VariationLabel(label.to_string()))
    }
}

#[test]
fn transition_splits_propagate_to_dependencies() {
    let mut ctx = test_ctx(&[
        ("Braidfile.list", "Braidfile\n"),
        (
            "Braidfile",
            "abin { name: \"app\", deps: [\"libx\"] }\nalib { name: \"libx\" }\nalib { name: \"unused\" }\n",
        ),
    ]);
    register_test_types(&mut ctx, &["abin", "alib"]);
    ctx.register_transition_mutator("arch", Arc::new(ArchTransition));
    analyze(&mut ctx, "Braidfile.list");
    let text = manifest(&mut ctx);

    // app splits intrinsically; libx splits because app demands both arms.
    for out in ["app.arm.out", "app.x86.out", "libx.arm.out", "libx.x86.out"] {
        assert!(text.contains(&format!("build {}", out)), "{}: {}", out, text);
    }
    // Each app variant depends on the matching libx variant.
    assert!(text.contains("build app.arm.out: phony libx"), "{}", text);
    // A module nobody demands stays unsplit.
    assert!(text.contains("build unused.out"), "{}", text);
    assert!(!text.contains("unused.arm"), "{}", text);
}

#[test]
fn transition_mutate_attaches_providers_per_variant() {
    use braid::{Singleton, SingletonContext};
    use std::sync::Mutex;

    struct Collect {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Singleton for Collect {
        fn generate_build_actions(&mut self, ctx: &mut SingletonContext<'_>) {
            ctx.visit_all_module_variants("app", |id| {
                if let Some(arch) = ctx.other_module_provider(id, *ARCH) {
                    self.seen.lock().unwrap().push(arch.0.clone());
                }
            });
        }
    }

    let mut ctx = test_ctx(&[
        ("Braidfile.list", "Braidfile\n"),
        ("Braidfile", "abin { name: \"app\" }\n"),
    ]);
    register_test_types(&mut ctx, &["abin"]);
    ctx.register_transition_mutator("arch", Arc::new(ArchTransition));
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    ctx.register_singleton("collect", Box::new(Collect { seen: seen.clone() }), false);
    analyze(&mut ctx, "Braidfile.list");

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["arm".to_string(), "x86".to_string()]);
}
