//! End-to-end pipeline tests: parse, resolve, generate, emit.

mod common;

use braid::{builtins, PrimaryBuilderInvocation, SimpleConfig};
use common::{analyze, manifest, register_test_types, test_ctx, test_ctx_with_config};
use difference::assert_diff;

#[test]
fn builtin_types_produce_a_manifest() {
    let mut ctx = test_ctx(&[
        ("Braidfile.list", "Braidfile\n"),
        (
            "Braidfile",
            r#"
            subdirs = ["lib"]

            shell_task {
                name: "gen_version",
                cmd: "echo 1 > $out",
                outs: ["version.h"],
                deps: ["headers"],
            }
            "#,
        ),
        (
            "lib/Braidfile",
            r#"
            filegroup {
                name: "headers",
                srcs: ["a.h", "b.h"],
            }
            "#,
        ),
    ]);
    builtins::register(&mut ctx);
    analyze(&mut ctx, "Braidfile.list");
    let text = manifest(&mut ctx);

    assert!(text.contains("ninja_required_version = 1.7"), "{}", text);
    // The filegroup publishes a provider but no actions, so only the
    // shell_task emits a block.
    assert!(text.contains("Module:  gen_version"), "{}", text);
    assert!(!text.contains("Module:  headers"), "{}", text);
    // The global rule and its variable are live and qualified.
    assert!(text.contains("braid.shell = /bin/sh"), "{}", text);
    assert!(text.contains("rule braid.shell"), "{}", text);
    assert!(text.contains("command = ${braid.shell} -c ${braid_cmd}"), "{}", text);
    // The dep's published files land as implicit inputs.
    assert!(text.contains("build out/version.h: braid.shell | lib/a.h lib/b.h"), "{}", text);
    assert!(text.contains("braid_cmd = echo 1 > $out"), "{}", text);
}

#[test]
fn configurable_properties_resolve_selects_end_to_end() {
    let files = [
        ("Braidfile.list", "Braidfile\n"),
        (
            "Braidfile",
            r#"
            shell_task {
                name: "pack",
                cmd: select(variable("compression"), {
                    "fast": "gzip -1 $out",
                    "small": "xz -9 $out",
                    default: "cat > $out",
                }),
                outs: ["archive"],
            }
            "#,
        ),
    ];

    let mut config = SimpleConfig::new("out");
    config.select_values.insert("compression".to_string(), "small".to_string());
    let mut ctx = test_ctx_with_config(&files, config);
    builtins::register(&mut ctx);
    analyze(&mut ctx, "Braidfile.list");
    let text = manifest(&ctx);
    assert!(text.contains("braid_cmd = xz -9 $out"), "{}", text);

    // Without a config value the default branch wins.
    let mut ctx = test_ctx_with_config(&files, SimpleConfig::new("out"));
    builtins::register(&mut ctx);
    analyze(&mut ctx, "Braidfile.list");
    let text = manifest(&ctx);
    assert!(text.contains("braid_cmd = cat > $out"), "{}", text);
}

#[test]
fn primary_builder_invocations_are_emitted() {
    let files = [
        ("Braidfile.list", "Braidfile\n"),
        ("Braidfile", "t { name: \"m\" }\n"),
    ];
    let invocation = |command: &str, output: &str, tests: bool| PrimaryBuilderInvocation {
        inputs: vec!["Braidfile.list".to_string()],
        outputs: vec![output.to_string()],
        command: command.to_string(),
        description: Some(format!("regenerating {}", output)),
        console: true,
        tests,
    };

    let mut config = SimpleConfig::new("out");
    config.primary_builder_invocations = vec![
        invocation("${host_tool_dir}/braid -o $out Braidfile.list", "build.ninja", false),
        invocation("${host_tool_dir}/braid-tests", "braid-tests.done", true),
    ];
    let mut ctx = test_ctx_with_config(&files, config.clone());
    register_test_types(&mut ctx, &["t"]);
    analyze(&mut ctx, "Braidfile.list");
    let text = manifest(&ctx);

    assert!(text.contains("# Primary builder invocations"), "{}", text);
    assert!(text.contains("host_tool_dir = out/host-tools"), "{}", text);
    assert!(text.contains("rule primary_builder_0"), "{}", text);
    assert!(
        text.contains("command = ${host_tool_dir}/braid -o $out Braidfile.list"),
        "{}",
        text,
    );
    assert!(text.contains("description = regenerating build.ninja"), "{}", text);
    assert!(text.contains("generator = true"), "{}", text);
    assert!(text.contains("pool = console"), "{}", text);
    assert!(text.contains("build build.ninja: primary_builder_0 Braidfile.list"), "{}", text);
    // The test-suite invocation is gated off by default.
    assert!(!text.contains("braid-tests"), "{}", text);

    // Flipping run_go_tests emits it too.
    config.run_go_tests = true;
    let mut ctx = test_ctx_with_config(&files, config);
    register_test_types(&mut ctx, &["t"]);
    analyze(&mut ctx, "Braidfile.list");
    let text = manifest(&ctx);
    assert!(text.contains("rule primary_builder_1"), "{}", text);
    assert!(text.contains("build braid-tests.done: primary_builder_1"), "{}", text);
}

#[test]
fn manifest_deps_include_every_parsed_file() {
    let mut ctx = test_ctx(&[
        ("Braidfile.list", "Braidfile\n"),
        ("Braidfile", "subdirs = [\"sub\"]\n"),
        ("sub/Braidfile", "t { name: \"m\" }\n"),
    ]);
    register_test_types(&mut ctx, &["t"]);
    analyze(&mut ctx, "Braidfile.list");
    assert_eq!(ctx.manifest_deps(), vec!["Braidfile.list", "Braidfile", "sub/Braidfile"]);
}

#[test]
fn scopes_inherit_down_the_tree_and_build_globs_expand() {
    let mut ctx = test_ctx(&[
        ("Braidfile.list", "Braidfile\n"),
        (
            "Braidfile",
            "common = \"shared\"\nsubdirs = [\"mods/*\"]\nbuild = [\"gen/*.braid\"]\n",
        ),
        ("mods/a/Braidfile", "t { name: \"a\", value: common }\n"),
        ("mods/b/Braidfile", "t { name: \"b\", value: common + \"-b\" }\n"),
        ("gen/extra.braid", "t { name: \"extra\", value: common }\n"),
        ("mods/empty_dir/placeholder.txt", ""),
    ]);
    register_test_types(&mut ctx, &["t"]);
    analyze(&mut ctx, "Braidfile.list");
    let text = manifest(&mut ctx);
    for name in ["a", "b", "extra"] {
        assert!(text.contains(&format!("Module:  {}", name)), "{}: {}", name, text);
    }
}

#[test]
fn order_only_dedup_promotes_shared_sets() {
    // Four shell tasks: two order on {gen1, gen2}, two on {gen1, gen3}.
    let mut src = String::new();
    for (name, extra) in [("t1", "gen2"), ("t2", "gen2"), ("t3", "gen3"), ("t4", "gen3")] {
        src += &format!(
            "oo_task {{ name: {:?}, value: {:?} }}\n",
            name, extra,
        );
    }
    let mut ctx = test_ctx(&[("Braidfile.list", "Braidfile\n"), ("Braidfile", &src)]);
    ctx.register_module_type("oo_task", oo_task::factory);
    analyze(&mut ctx, "Braidfile.list");
    let text = manifest(&mut ctx);

    let phony_defs: Vec<&str> =
        text.lines().filter(|l| l.starts_with("build dedup-")).collect();
    assert_eq!(phony_defs.len(), 2, "{}", text);
    assert!(phony_defs.iter().any(|l| l.ends_with(": phony gen1 gen2")), "{:?}", phony_defs);
    assert!(phony_defs.iter().any(|l| l.ends_with(": phony gen1 gen3")), "{:?}", phony_defs);
    // Phonies are emitted sorted by output name.
    assert!(phony_defs[0] < phony_defs[1]);

    // Every use site was rewritten to exactly one dedup name.
    let use_sites: Vec<&str> =
        text.lines().filter(|l| l.contains("|| ") && !l.starts_with("build dedup-")).collect();
    assert_eq!(use_sites.len(), 4, "{}", text);
    for line in use_sites {
        let after = line.split("|| ").nth(1).unwrap();
        assert!(after.starts_with("dedup-"), "{}", line);
        assert_eq!(after.split_whitespace().count(), 1, "{}", line);
    }
}

mod oo_task {
    use braid::{
        BuildParams, Field, FieldRef, Module, ModuleContext, PropertyStruct, RuleRef,
    };
    use std::any::Any;

    #[derive(Default)]
    pub struct Props {
        name: Option<String>,
        value: Option<String>,
    }

    impl PropertyStruct for Props {
        fn fields(&mut self) -> Vec<Field<'_>> {
            vec![
                Field::new("name", FieldRef::String(&mut self.name)),
                Field::new("value", FieldRef::String(&mut self.value)),
            ]
        }
    }

    /// Emits one build-def ordered after {gen1, <value>}.
    #[derive(Default)]
    pub struct OoTask {
        props: Props,
    }

    impl Module for OoTask {
        fn property_structs(&mut self) -> Vec<&mut dyn PropertyStruct> {
            vec![&mut self.props]
        }

        fn generate_build_actions(&mut self, ctx: &mut ModuleContext<'_>) {
            let extra = self.props.value.clone().unwrap_or_default();
            ctx.build(BuildParams {
                rule: RuleRef::Phony,
                outputs: vec![format!("{}.out", ctx.module_name())],
                order_only: vec!["gen1".to_string(), extra],
                ..Default::default()
            });
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    pub fn factory() -> Box<dyn Module> {
        Box::new(OoTask::default())
    }
}

#[test]
fn unknown_module_type_is_a_positioned_error() {
    let mut ctx = test_ctx(&[
        ("Braidfile.list", "Braidfile\n"),
        ("Braidfile", "\nnope { name: \"x\" }\n"),
    ]);
    let errs = ctx.parse_file_list("Braidfile.list").unwrap_err();
    let text = errs[0].to_string();
    assert!(text.contains("Braidfile:2:1"), "{}", text);
    assert!(text.contains("unrecognized module type \"nope\""), "{}", text);
}

#[test]
fn unknown_property_is_a_positioned_error() {
    let mut ctx = test_ctx(&[
        ("Braidfile.list", "Braidfile\n"),
        ("Braidfile", "t { name: \"x\", bogus: 1 }\n"),
    ]);
    register_test_types(&mut ctx, &["t"]);
    let errs = ctx.parse_file_list("Braidfile.list").unwrap_err();
    assert!(errs[0].to_string().contains("unrecognized property \"bogus\""), "{:?}", errs);
}

#[test]
fn duplicate_module_names_collide() {
    let mut ctx = test_ctx(&[
        ("Braidfile.list", "Braidfile\n"),
        ("Braidfile", "t { name: \"x\" }\nt { name: \"x\" }\n"),
    ]);
    register_test_types(&mut ctx, &["t"]);
    let errs = ctx.parse_file_list("Braidfile.list").unwrap_err();
    assert!(errs[0].to_string().contains("already defined"), "{:?}", errs);
}

#[test]
fn missing_dependency_suggests_close_names() {
    let mut ctx = test_ctx(&[
        ("Braidfile.list", "Braidfile\n"),
        (
            "Braidfile",
            "t { name: \"libfoo\" }\nt { name: \"app\", deps: [\"libfo\"] }\n",
        ),
    ]);
    register_test_types(&mut ctx, &["t"]);
    ctx.parse_file_list("Braidfile.list").unwrap();
    let errs = ctx.resolve_dependencies().unwrap_err();
    let text = errs[0].to_string();
    assert!(text.contains("depends on undefined module \"libfo\""), "{}", text);
    assert!(text.contains("did you mean \"libfoo\"?"), "{}", text);
}

#[test]
fn dependency_cycles_are_reported_with_the_full_path() {
    let mut ctx = test_ctx(&[
        ("Braidfile.list", "Braidfile\n"),
        (
            "Braidfile",
            "t { name: \"a\", deps: [\"b\"] }\nt { name: \"b\", deps: [\"a\"] }\n",
        ),
    ]);
    register_test_types(&mut ctx, &["t"]);
    ctx.parse_file_list("Braidfile.list").unwrap();
    let errs = ctx.resolve_dependencies().unwrap_err();
    let text = errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n");
    assert!(text.contains("encountered dependency cycle"), "{}", text);
    assert!(text.contains("\"a\": depends on b"), "{}", text);
    assert!(text.contains("\"b\": depends on a"), "{}", text);
}

#[test]
fn allowed_missing_deps_are_recorded_not_fatal() {
    let mut ctx = test_ctx(&[
        ("Braidfile.list", "Braidfile\n"),
        ("Braidfile", "t { name: \"app\", deps: [\"ghost\"] }\n"),
    ]);
    register_test_types(&mut ctx, &["t"]);
    ctx.set_allow_missing_dependencies(true);
    ctx.parse_file_list("Braidfile.list").unwrap();
    ctx.resolve_dependencies().unwrap();
    // The test module never consults missing deps, so generation reports
    // them.
    let errs = ctx.prepare_build_actions().unwrap_err();
    assert!(errs[0].to_string().contains("missing dependencies: ghost"), "{:?}", errs);
}

#[test]
fn source_root_allowlist_skips_modules() {
    let mut ctx = test_ctx(&[
        ("Braidfile.list", "Braidfile\nvendor/Braidfile\nmain/Braidfile\n"),
        ("Braidfile", "\n"),
        ("vendor/Braidfile", "t { name: \"skipped\" }\n"),
        ("main/Braidfile", "t { name: \"kept\" }\n"),
    ]);
    register_test_types(&mut ctx, &["t"]);
    ctx.add_source_root_dirs(["", "-vendor"]);
    analyze(&mut ctx, "Braidfile.list");
    let text = manifest(&mut ctx);
    assert!(text.contains("Module:  kept"), "{}", text);
    assert!(!text.contains("skipped"), "{}", text);
}

#[test]
fn empty_manifest_mode_emits_headers_only() {
    let ctx = test_ctx(&[("Braidfile.list", "")]);
    let mut buf = Vec::new();
    ctx.write_empty_build_file(&mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();
    let expected = "\
# This file is generated by braid. Do not edit.

ninja_required_version = 1.7

";
    assert_diff!(&text, expected, "\n", 0);
}
