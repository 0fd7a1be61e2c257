use std::time::Duration;

use tenmon::{
    Blueprint, Cancelled, Catalog, Environment, Frame, MetaTarget, RecipeOutput, Recipes, RunError, Workflow,
};

// -----------------------------------------------------------------------------
// ANDES calibration cascade
//
// bias -> dark -> flat -> wavecal -> science
//
// The recipes below are stand-ins: they sleep for a moment and write nothing,
// returning a product path named after the instantiation. Swap them for real
// pipeline bindings to reduce actual data.
//
// Usage:
//
//   cargo run --example andes                  # built-in night of frames
//   cargo run --example andes -- catalog.json  # frames from a JSON catalog
//   cargo run --example andes -- --mermaid     # print the executed graph
// -----------------------------------------------------------------------------

fn workflow() -> anyhow::Result<Workflow> {
    let mut bp = Blueprint::new();

    // -------------------------------------------------------------------------
    // 1. Classification rules
    // -------------------------------------------------------------------------
    let rule = |bp: &mut Blueprint, label: &str, catg: &str, kind: &str, tech: &str| {
        bp.classification_rule(
            label,
            [
                ("instrume", "ANDES"),
                ("dpr.catg", catg),
                ("dpr.type", kind),
                ("dpr.tech", tech),
            ],
        )
    };

    let bias_class = rule(&mut bp, "BIAS", "CALIB", "BIAS", "IMAGE,RIZ")?;
    let dark_class = rule(&mut bp, "DARK", "CALIB", "DARK", "IMAGE,RIZ")?;
    rule(&mut bp, "LED", "CALIB", "LED", "IMAGE,RIZ")?;
    rule(&mut bp, "ORDEF", "CALIB", "ORDERDEF,FLAT,FLAT,FLAT", "ECHELLE,RIZ")?;
    rule(&mut bp, "SLITDEF", "CALIB", "SLITDEF,FP,FP,FP", "ECHELLE,RIZ")?;
    let flat_class = rule(&mut bp, "FLAT", "CALIB", "FLAT,FLAT,FLAT", "ECHELLE,RIZ")?;
    let wave_class = rule(&mut bp, "WAVE", "CALIB", "WAVE,FP,FP,FP", "ECHELLE,RIZ")?;
    rule(&mut bp, "CONTAM", "CALIB", "DARK,FP,DARK", "ECHELLE,RIZ")?;
    let science_class = rule(&mut bp, "SCIENCE", "SCIENCE", "OBJECT,FP,SKY", "ECHELLE,RIZ")?;

    // -------------------------------------------------------------------------
    // 2. Data sources
    // -------------------------------------------------------------------------
    let mut source = |class| {
        bp.data_source()
            .with_classification_rule(class)
            .with_match_keywords(["instrume"])
            .build()
    };

    let bias = source(bias_class)?;
    let dark = source(dark_class)?;
    let flat = source(flat_class)?;
    let wave = source(wave_class)?;
    let science_sl = source(science_class)?;

    // -------------------------------------------------------------------------
    // 3. Tasks
    // -------------------------------------------------------------------------
    let bias_task = bp
        .task("bias")
        .with_recipe("andes_cal_bias")
        .with_main_input(bias)
        .with_meta_targets([MetaTarget::QC1_CALIB])
        .build()?;

    let dark_task = bp.subworkflow("dark", bias_task, |bp, bias_task| {
        let detcal = bp
            .task("dark_detcal")
            .with_recipe("andes_util_detcal")
            .with_main_input(dark)
            .with_associated_input(bias_task)
            .build()?;
        bp.task("dark")
            .with_recipe("andes_cal_dark")
            .with_main_input(detcal)
            .with_meta_targets([MetaTarget::QC1_CALIB])
            .build()
    })?;

    let flat_task = bp.subworkflow(
        "flat",
        (bias_task, dark_task),
        |bp, (bias_task, dark_task)| {
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
        },
    )?;

    let wavecal_task = bp.subworkflow(
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
    )?;

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
                .with_option("extract.method", "optimal")
                .with_meta_targets([MetaTarget::SCIENCE])
                .build()
        },
    )?;

    Ok(bp.finish()?)
}

fn recipes() -> Recipes {
    let names = [
        ("andes_cal_bias", 40),
        ("andes_util_detcal", 60),
        ("andes_cal_dark", 80),
        ("andes_util_extract", 120),
        ("andes_cal_flat", 80),
        ("andes_cal_wave_FP", 150),
        ("andes_util_bkgr", 60),
        ("andes_science", 200),
    ];

    names.into_iter().fold(Recipes::new(), |acc, (name, millis)| {
        acc.register_fn(name, move |inv| {
            for _ in 0..10 {
                if inv.is_cancelled() {
                    return Err(Cancelled.into());
                }
                std::thread::sleep(Duration::from_millis(millis / 10));
            }

            let file = format!("reduced/{}.fits", inv.instance.replace('/', "_"));
            Ok(RecipeOutput::file(file).with_meta("pro.rec1.id", inv.recipe))
        })
    })
}

/// One night: two bias and dark sets, calibrations and two science exposures.
fn sample_catalog() -> Catalog {
    let frame = |n: usize, catg: &str, kind: &str, tech: &str, mjd: f64| {
        Frame::new(
            format!("raw/ANDES.{n:04}.fits"),
            [
                ("instrume", "ANDES".to_string()),
                ("dpr.catg", catg.to_string()),
                ("dpr.type", kind.to_string()),
                ("dpr.tech", tech.to_string()),
                ("mjd-obs", format!("{mjd:.4}")),
            ],
        )
    };

    Catalog::new([
        frame(1, "CALIB", "BIAS", "IMAGE,RIZ", 60500.10),
        frame(2, "CALIB", "BIAS", "IMAGE,RIZ", 60500.11),
        frame(3, "CALIB", "DARK", "IMAGE,RIZ", 60500.15),
        frame(4, "CALIB", "DARK", "IMAGE,RIZ", 60500.16),
        frame(5, "CALIB", "FLAT,FLAT,FLAT", "ECHELLE,RIZ", 60500.20),
        frame(6, "CALIB", "LED", "IMAGE,RIZ", 60500.21),
        frame(7, "CALIB", "WAVE,FP,FP,FP", "ECHELLE,RIZ", 60500.25),
        frame(8, "SCIENCE", "OBJECT,FP,SKY", "ECHELLE,RIZ", 60500.60),
        frame(9, "SCIENCE", "OBJECT,FP,SKY", "ECHELLE,RIZ", 60500.65),
    ])
}

fn main() -> anyhow::Result<()> {
    tenmon::init_logging()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mermaid = args.iter().any(|a| a == "--mermaid");

    let catalog = match args.iter().find(|a| !a.starts_with("--")) {
        Some(path) => Catalog::from_json_file(path.as_str())?,
        None => sample_catalog(),
    };

    let workflow = workflow()?;
    let env = Environment::new(recipes());

    let report = match workflow.run(&catalog, &env) {
        Ok(report) => report,
        Err(RunError::Failure(failure)) => {
            eprint!("{}", failure.report.summary());
            return Err(RunError::Failure(failure).into());
        }
        Err(RunError::Cancelled { report }) => {
            eprint!("{}", report.summary());
            return Err(RunError::Cancelled { report }.into());
        }
        Err(e) => return Err(e.into()),
    };

    print!("{}", report.summary());

    if mermaid {
        println!("{}", report.render_mermaid());
    }

    Ok(())
}
