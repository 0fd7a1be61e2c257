//! End-to-end runs of the ANDES calibration cascade.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::*;

fn andes(dpr_catg: &str, dpr_type: &str, dpr_tech: &str) -> Vec<(&'static str, String)> {
    vec![
        ("instrume", "ANDES".to_string()),
        ("dpr.catg", dpr_catg.to_string()),
        ("dpr.type", dpr_type.to_string()),
        ("dpr.tech", dpr_tech.to_string()),
    ]
}

fn frame(path: &str, dpr_catg: &str, dpr_type: &str, dpr_tech: &str) -> Frame {
    Frame::new(path, andes(dpr_catg, dpr_type, dpr_tech))
}

fn bias_frame() -> Frame {
    frame("raw/bias_1.fits", "CALIB", "BIAS", "IMAGE,RIZ")
}

fn dark_frame() -> Frame {
    frame("raw/dark_1.fits", "CALIB", "DARK", "IMAGE,RIZ")
}

fn flat_frame() -> Frame {
    frame("raw/flat_1.fits", "CALIB", "FLAT,FLAT,FLAT", "ECHELLE,RIZ")
}

fn wave_frame() -> Frame {
    frame("raw/wave_1.fits", "CALIB", "WAVE,FP,FP,FP", "ECHELLE,RIZ")
}

fn science_frame() -> Frame {
    frame("raw/sci_1.fits", "SCIENCE", "OBJECT,FP,SKY", "ECHELLE,RIZ")
}

struct Andes {
    workflow: Workflow,
}

fn workflow() -> Andes {
    let mut bp = Blueprint::new();

    let rule = |bp: &mut Blueprint, label: &str, catg: &str, kind: &str, tech: &str| {
        bp.classification_rule(label, andes(catg, kind, tech))
    };

    let bias_class = rule(&mut bp, "BIAS", "CALIB", "BIAS", "IMAGE,RIZ").unwrap();
    let dark_class = rule(&mut bp, "DARK", "CALIB", "DARK", "IMAGE,RIZ").unwrap();
    rule(&mut bp, "LED", "CALIB", "LED", "IMAGE,RIZ").unwrap();
    let flat_class = rule(&mut bp, "FLAT", "CALIB", "FLAT,FLAT,FLAT", "ECHELLE,RIZ").unwrap();
    let wave_class = rule(&mut bp, "WAVE", "CALIB", "WAVE,FP,FP,FP", "ECHELLE,RIZ").unwrap();
    let science_class = rule(&mut bp, "SCIENCE", "SCIENCE", "OBJECT,FP,SKY", "ECHELLE,RIZ").unwrap();

    let source = |bp: &mut Blueprint, rule: RuleHandle| {
        bp.data_source()
            .with_classification_rule(rule)
            .with_match_keywords(["instrume"])
            .build()
            .unwrap()
    };

    let bias = source(&mut bp, bias_class);
    let dark = source(&mut bp, dark_class);
    let flat = source(&mut bp, flat_class);
    let wave = source(&mut bp, wave_class);
    let science_sl = source(&mut bp, science_class);

    let bias_task = bp
        .task("bias")
        .with_recipe("andes_cal_bias")
        .with_main_input(bias)
        .build()
        .unwrap();

    let dark_task = bp
        .subworkflow("dark", bias_task, |bp, bias_task| {
            let detcal = bp
                .task("dark_detcal")
                .with_recipe("andes_util_detcal")
                .with_main_input(dark)
                .with_associated_input(bias_task)
                .build()?;
            bp.task("dark")
                .with_recipe("andes_cal_dark")
                .with_main_input(detcal)
                .build()
        })
        .unwrap();

    let flat_task = bp
        .subworkflow("flat", (bias_task, dark_task), |bp, (bias_task, dark_task)| {
            let detcal = bp
                .task("flat_detcal")
                .with_recipe("andes_util_detcal")
                .with_main_input(flat)
                .with_associated_input(bias_task)
                .with_associated_input(dark_task)
                .build()?;
            let extract = bp
                .task("flat_extract")
                .with_recipe("andes_util_extract")
                .with_main_input(detcal)
                .build()?;
            bp.task("flat")
                .with_recipe("andes_cal_flat")
                .with_main_input(extract)
                .build()
        })
        .unwrap();

    let wavecal_task = bp
        .subworkflow(
            "wavecal",
            (bias_task, dark_task, flat_task),
            |bp, (bias_task, dark_task, flat_task)| {
                let detcal = bp
                    .task("wave_detcal")
                    .with_recipe("andes_util_detcal")
                    .with_main_input(wave)
                    .with_associated_input(bias_task)
                    .with_associated_input(dark_task)
                    .build()?;
                let extract = bp
                    .task("wave_extract")
                    .with_recipe("andes_util_extract")
                    .with_main_input(detcal)
                    .with_associated_input(flat_task)
                    .build()?;
                bp.task("wavecal")
                    .with_recipe("andes_cal_wave_FP")
                    .with_main_input(extract)
                    .build()
            },
        )
        .unwrap();

    bp.subworkflow(
        "science",
        (bias_task, dark_task, flat_task, wavecal_task),
        |bp, (bias_task, dark_task, flat_task, wavecal_task)| {
            let detcal = bp
                .task("sci_detcal")
                .with_recipe("andes_util_detcal")
                .with_main_input(science_sl)
                .with_associated_input(bias_task)
                .with_associated_input(dark_task)
                .build()?;
            let bkgr = bp
                .task("sci_bkgr")
                .with_recipe("andes_util_bkgr")
                .with_main_input(detcal)
                .build()?;
            let extract = bp
                .task("sci_extract")
                .with_recipe("andes_util_extract")
                .with_main_input(bkgr)
                .with_associated_input(flat_task)
                .build()?;
            bp.task("science")
                .with_recipe("andes_science")
                .with_main_input(extract)
                .with_associated_input(wavecal_task)
                .with_meta_targets([MetaTarget::SCIENCE])
                .build()
        },
    )
    .unwrap();

    Andes {
        workflow: bp.finish().unwrap(),
    }
}

const RECIPES: &[&str] = &[
    "andes_cal_bias",
    "andes_util_detcal",
    "andes_cal_dark",
    "andes_util_extract",
    "andes_cal_flat",
    "andes_cal_wave_FP",
    "andes_util_bkgr",
    "andes_science",
];

/// Every recipe writes one file named after the instantiation and records
/// which instantiations it was called for.
fn recipes(calls: &Arc<Mutex<Vec<String>>>) -> Recipes {
    RECIPES.iter().fold(Recipes::new(), |acc, name| {
        let calls = calls.clone();
        acc.register_fn(*name, move |inv| {
            calls.lock().unwrap().push(inv.instance.to_string());
            Ok(RecipeOutput::file(format!("out/{}.fits", inv.instance)))
        })
    })
}

fn env(calls: &Arc<Mutex<Vec<String>>>) -> Environment {
    Environment::new(recipes(calls)).with_options(RunOptions {
        workers: 2,
        progress: false,
    })
}

fn full_catalog() -> Catalog {
    Catalog::new([
        bias_frame(),
        dark_frame(),
        flat_frame(),
        wave_frame(),
        science_frame(),
    ])
}

#[test]
fn scenario_bias_classification() {
    let Andes { workflow } = workflow();

    let rule = workflow.classifier().classify(&bias_frame().meta).unwrap();
    assert_eq!(rule.label(), "BIAS");

    let plan = workflow.plan(&Catalog::new([bias_frame()]));
    assert_eq!(plan.len(), 1);

    let instance = &plan.instances()[0];
    assert_eq!(instance.task(), "bias");
    assert_eq!(instance.label(), "bias[instrume=ANDES]");
    assert!(instance.associated.is_empty());
    assert_eq!(instance.group().unwrap().frames, vec![bias_frame()]);
}

#[test]
fn scenario_dark_consumes_bias() {
    let Andes { workflow } = workflow();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let catalog = Catalog::new([dark_frame(), bias_frame()]);
    let plan = workflow.plan(&catalog);

    let detcal: Vec<_> = plan.of_task("dark/dark_detcal").collect();
    assert_eq!(detcal.len(), 1);
    assert_eq!(detcal[0].associated.len(), 1);
    assert_eq!(plan.of_task("dark/dark").count(), 1);

    let report = workflow.run(&catalog, &env(&calls)).unwrap();
    assert_eq!(report.count(Status::Succeeded), 3);

    let calls = calls.lock().unwrap();
    let pos = |label: &str| calls.iter().position(|c| c == label).unwrap();
    assert!(pos("bias[instrume=ANDES]") < pos("dark/dark_detcal[instrume=ANDES]"));
    assert!(pos("dark/dark_detcal[instrume=ANDES]") < pos("dark/dark[instrume=ANDES]"));

    let detcal = report.get("dark/dark_detcal[instrume=ANDES]").unwrap();
    assert_eq!(detcal.producers, vec!["bias[instrume=ANDES]".to_string()]);
}

#[test]
fn scenario_science_delivered() {
    let Andes { workflow } = workflow();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::new(CollectDelivery::new());

    let env = env(&calls).with_delivery(sink.clone());
    let report = workflow.run(&full_catalog(), &env).unwrap();

    assert!(report.is_success());
    assert_eq!(report.count(Status::Succeeded), report.instances.len());

    let science: Vec<_> = report.of_task("science/science").collect();
    assert_eq!(science.len(), 1);
    assert_eq!(science[0].meta_targets, vec![MetaTarget::SCIENCE]);

    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0.task, "science/science");
    assert_eq!(delivered[0].1, vec![MetaTarget::SCIENCE]);
    assert_eq!(
        delivered[0].0.files,
        vec![camino::Utf8PathBuf::from("out/science/science[instrume=ANDES].fits")]
    );
}

#[test]
fn scenario_science_without_wavecal() {
    let Andes { workflow } = workflow();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::new(CollectDelivery::new());

    let catalog = Catalog::new([bias_frame(), dark_frame(), flat_frame(), science_frame()]);
    let env = env(&calls).with_delivery(sink.clone());

    let Err(RunError::Failure(failure)) = workflow.run(&catalog, &env) else {
        panic!("science should fail");
    };

    assert_eq!(failure.failed.len(), 1);
    let science = &failure.failed[0];
    assert_eq!(science.task, "science/science");
    assert!(matches!(
        science.error,
        Some(TaskError::MissingAssociatedInput(ref name)) if name == "wavecal/wavecal"
    ));

    let extract: Vec<_> = failure.report.of_task("science/sci_extract").collect();
    assert_eq!(extract.len(), 1);
    assert_eq!(extract[0].status, Status::Succeeded);

    assert!(sink.delivered().is_empty());
    assert!(!calls.lock().unwrap().iter().any(|c| c.starts_with("science/science")));
}

#[test]
fn scenario_duplicate_task_in_scope() {
    let mut bp = Blueprint::new();
    let rule = bp.classification_rule("BIAS", [("dpr.type", "BIAS")]).unwrap();
    let bias = bp.data_source().with_classification_rule(rule).build().unwrap();

    let err = bp
        .subworkflow("dark", (), |bp, ()| {
            bp.task("dark").with_recipe("r").with_main_input(bias).build()?;
            bp.task("dark").with_recipe("r").with_main_input(bias).build()
        })
        .unwrap_err();

    assert_eq!(err, ConfigurationError::DuplicateTask("dark/dark".into()));
}

#[test]
fn failure_cascades_without_invoking_consumers() {
    let Andes { workflow } = workflow();
    let invoked = Arc::new(AtomicUsize::new(0));

    let mut recipes = recipes(&Arc::new(Mutex::new(Vec::new())));
    recipes.insert(
        "andes_cal_bias",
        Arc::new(|_: &Invocation<'_>| -> anyhow::Result<RecipeOutput> {
            anyhow::bail!("detector saturated")
        }),
    );
    let counter = invoked.clone();
    recipes.insert(
        "andes_util_detcal",
        Arc::new(move |inv: &Invocation<'_>| -> anyhow::Result<RecipeOutput> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(RecipeOutput::file(format!("{}.fits", inv.instance)))
        }),
    );

    let env = Environment::new(recipes).with_workers(4);
    let Err(RunError::Failure(failure)) = workflow.run(&full_catalog(), &env) else {
        panic!("science should fail");
    };

    // every detcal needs the master bias
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    let science = &failure.failed[0];
    let chain = science.cause_chain();
    assert_eq!(chain.first().map(String::as_str), Some("science/science[instrume=ANDES]"));
    assert_eq!(chain.last().map(String::as_str), Some("Recipe 'andes_cal_bias' failed: detector saturated"));

    let report = &failure.report;
    assert_eq!(report.count(Status::Succeeded), 0);
    assert_eq!(report.count(Status::Failed), report.instances.len());
}

#[test]
fn panicking_recipe_fails_only_its_branch() {
    let Andes { workflow } = workflow();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let mut recipes = recipes(&calls);
    recipes.insert(
        "andes_cal_wave_FP",
        Arc::new(|_: &Invocation<'_>| -> anyhow::Result<RecipeOutput> { panic!("no lines found") }),
    );

    let env = Environment::new(recipes).with_workers(2);
    let Err(RunError::Failure(failure)) = workflow.run(&full_catalog(), &env) else {
        panic!("science should fail");
    };

    let report = &failure.report;
    let wavecal = report.of_task("wavecal/wavecal").next().unwrap();
    assert!(matches!(
        wavecal.error,
        Some(TaskError::Panicked { ref message, .. }) if message == "no lines found"
    ));
    assert_eq!(
        report.of_task("science/sci_extract").next().unwrap().status,
        Status::Succeeded
    );
    assert_eq!(report.of_task("flat/flat").next().unwrap().status, Status::Succeeded);
}

#[test]
fn empty_output_is_invalid() {
    let Andes { workflow } = workflow();

    let mut recipes = recipes(&Arc::new(Mutex::new(Vec::new())));
    recipes.insert(
        "andes_cal_bias",
        Arc::new(|_: &Invocation<'_>| -> anyhow::Result<RecipeOutput> { Ok(RecipeOutput::default()) }),
    );

    // bias is not meta-tagged, so the run itself succeeds
    let catalog = Catalog::new([bias_frame()]);
    let report = workflow.run(&catalog, &Environment::new(recipes)).unwrap();
    let bias = report.get("bias[instrume=ANDES]").unwrap();
    assert_eq!(bias.status, Status::Failed);
    assert!(matches!(bias.error, Some(TaskError::InvalidOutput(_))));
}

#[test]
fn optional_input_is_skipped_when_missing() {
    let mut bp = Blueprint::new();
    let bias_class = bp.classification_rule("BIAS", andes("CALIB", "BIAS", "IMAGE,RIZ")).unwrap();
    let dark_class = bp.classification_rule("DARK", andes("CALIB", "DARK", "IMAGE,RIZ")).unwrap();
    let bias = bp
        .data_source()
        .with_classification_rule(bias_class)
        .with_match_keywords(["instrume"])
        .build()
        .unwrap();
    let dark = bp
        .data_source()
        .with_classification_rule(dark_class)
        .with_match_keywords(["instrume"])
        .build()
        .unwrap();

    let master = bp
        .task("bias")
        .with_recipe("fail")
        .with_main_input(bias)
        .build()
        .unwrap();
    bp.task("dark")
        .with_recipe("ok")
        .with_main_input(dark)
        .with_optional_associated_input(master)
        .with_meta_targets([MetaTarget::QC1_CALIB])
        .build()
        .unwrap();
    let workflow = bp.finish().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let recipes = Recipes::new()
        .register_fn("fail", |_| anyhow::bail!("broken"))
        .register_fn("ok", move |inv| {
            record.lock().unwrap().push(inv.associated.len());
            Ok(RecipeOutput::file("dark.fits"))
        });

    // producer fails
    let report = workflow
        .run(&Catalog::new([bias_frame(), dark_frame()]), &Environment::new(recipes.clone()))
        .unwrap();
    assert_eq!(report.get("dark[instrume=ANDES]").unwrap().status, Status::Succeeded);

    // producer absent
    let report = workflow
        .run(&Catalog::new([dark_frame()]), &Environment::new(recipes))
        .unwrap();
    assert!(report.is_success());

    assert_eq!(*seen.lock().unwrap(), vec![0, 0]);
}

#[test]
fn cancellation_discards_pending_work() {
    let Andes { workflow } = workflow();
    let cancel = CancelToken::new();

    let mut recipes = recipes(&Arc::new(Mutex::new(Vec::new())));
    let trigger = cancel.clone();
    recipes.insert(
        "andes_cal_bias",
        Arc::new(move |inv: &Invocation<'_>| -> anyhow::Result<RecipeOutput> {
            trigger.cancel();
            assert!(inv.is_cancelled());
            Ok(RecipeOutput::file("bias.fits"))
        }),
    );

    let env = Environment::new(recipes).with_workers(1).with_cancel(cancel);
    let Err(RunError::Cancelled { report }) = workflow.run(&full_catalog(), &env) else {
        panic!("a cancelled run must not report success");
    };

    assert!(!report.is_success());
    let bias = report.get("bias[instrume=ANDES]").unwrap();
    assert_eq!(bias.status, Status::Succeeded);
    assert_eq!(
        report.get("science/science[instrume=ANDES]").unwrap().status,
        Status::Cancelled
    );
    assert!(report.instances.iter().all(|i| i.status.is_terminal()));
    assert_eq!(report.count(Status::Failed), 0);
}

#[test]
fn recipe_stopping_on_cancellation_cancels_dependents() {
    let Andes { workflow } = workflow();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let mut recipes = recipes(&calls);
    recipes.insert(
        "andes_cal_wave_FP",
        Arc::new(|_: &Invocation<'_>| -> anyhow::Result<RecipeOutput> { Err(Cancelled.into()) }),
    );

    let env = Environment::new(recipes).with_workers(2);
    let Err(RunError::Cancelled { report }) = workflow.run(&full_catalog(), &env) else {
        panic!("science should be cancelled");
    };

    let wavecal = report.of_task("wavecal/wavecal").next().unwrap();
    assert_eq!(wavecal.status, Status::Cancelled);
    assert!(wavecal.error.is_none());

    let science = report.of_task("science/science").next().unwrap();
    assert_eq!(science.status, Status::Cancelled);
    assert!(science.error.is_none());

    assert_eq!(report.count(Status::Failed), 0);
    assert_eq!(report.of_task("flat/flat").next().unwrap().status, Status::Succeeded);
    assert!(!calls.lock().unwrap().iter().any(|c| c.starts_with("science/science")));
}

#[test]
fn worker_pool_bounds_concurrency() {
    let mut bp = Blueprint::new();
    let rule = bp.classification_rule("BIAS", [("dpr.type", "BIAS")]).unwrap();
    let bias = bp
        .data_source()
        .with_classification_rule(rule)
        .with_match_keywords(["det.id"])
        .build()
        .unwrap();
    bp.task("bias")
        .with_recipe("andes_cal_bias")
        .with_main_input(bias)
        .with_meta_targets([MetaTarget::QC1_CALIB])
        .build()
        .unwrap();
    let workflow = bp.finish().unwrap();

    let catalog = Catalog::new((0..8).map(|n| {
        Frame::new(
            format!("raw/bias_{n}.fits"),
            [("dpr.type", "BIAS".to_string()), ("det.id", n.to_string())],
        )
    }));

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (running, highest) = (current.clone(), peak.clone());
    let recipes = Recipes::new().register_fn("andes_cal_bias", move |inv| {
        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
        highest.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(20));
        running.fetch_sub(1, Ordering::SeqCst);
        Ok(RecipeOutput::file(format!("{}.fits", inv.instance)))
    });

    let env = Environment::new(recipes).with_options(RunOptions {
        workers: 3,
        progress: false,
    });
    let report = workflow.run(&catalog, &env).unwrap();

    assert_eq!(report.count(Status::Succeeded), 8);
    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=3).contains(&peak), "{peak} recipes ran at once");
    assert_eq!(current.load(Ordering::SeqCst), 0);
}

struct RejectingDelivery;

impl Delivery for RejectingDelivery {
    fn deliver(&self, product: &Product, _: &[MetaTarget]) -> anyhow::Result<()> {
        anyhow::bail!("archive refused {}", product.instance)
    }
}

#[test]
fn delivery_error_aborts_run() {
    let Andes { workflow } = workflow();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let env = env(&calls).with_delivery(Arc::new(RejectingDelivery));
    let err = workflow.run(&full_catalog(), &env).unwrap_err();

    let RunError::Delivery(label, cause) = err else {
        panic!("expected a delivery error");
    };
    assert_eq!(label, "science/science[instrume=ANDES]");
    assert_eq!(cause.to_string(), "archive refused science/science[instrume=ANDES]");
}

#[test]
fn unknown_recipe_is_rejected_before_running() {
    let Andes { workflow } = workflow();
    let recipes = Recipes::new().register_fn("andes_cal_bias", |_| Ok(RecipeOutput::file("b.fits")));

    let err = workflow
        .run(&full_catalog(), &Environment::new(recipes))
        .unwrap_err();

    assert!(matches!(
        err,
        RunError::Configuration(ConfigurationError::UnknownRecipe { ref task, .. }) if task == "dark/dark_detcal"
    ));
}

#[test]
fn planning_is_deterministic() {
    let Andes { workflow } = workflow();
    let catalog = full_catalog();

    let fingerprints = |plan: &Plan| -> Vec<_> {
        plan.instances()
            .iter()
            .filter_map(|i| i.group().map(Group::fingerprint))
            .collect()
    };

    let a = workflow.plan(&catalog);
    let b = workflow.plan(&catalog);

    let labels = |plan: &Plan| -> Vec<String> {
        plan.instances().iter().map(|i| i.label().to_string()).collect()
    };
    assert_eq!(labels(&a), labels(&b));
    assert_eq!(fingerprints(&a), fingerprints(&b));
    assert_eq!(a.len(), 13);
}
