use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use fragstream_convert::{
    ConversionError, ConvertOptions, Converter, JobOutcome, Progress, RuntimeLocator, Stage,
};
use fragstream_format::PropertyValue;

const TEN_MB: usize = 10 * 1024 * 1024;

/// Build an IFC4 file of box-shaped elements until it reaches `min_bytes`.
fn synthetic_ifc(min_bytes: usize) -> (Vec<u8>, usize) {
    let mut out = String::with_capacity(min_bytes + 4096);
    out.push_str(
        "ISO-10303-21;\nHEADER;\nFILE_DESCRIPTION(('ViewDefinition [CoordinationView]'),'2;1');\n\
         FILE_NAME('synthetic.ifc','2026-01-01T00:00:00',(''),(''),'','','');\n\
         FILE_SCHEMA(('IFC4'));\nENDSEC;\nDATA;\n",
    );
    out.push_str("#1=IFCPROJECT('0YvctVUKr0kugbFTf53O9L',$,'Synthetic Tower',$,$,$,$,$,$);\n");

    let classes = ["IFCWALL", "IFCSLAB", "IFCCOLUMN"];
    let mut next = 10u64;
    let mut id = || {
        next += 1;
        next
    };
    let mut count = 0usize;
    while out.len() < min_bytes {
        let x = (count % 100) as f64 * 5.0;
        let z = (count / 100) as f64 * 5.0;

        let origin = id();
        let _ = writeln!(out, "#{origin}=IFCCARTESIANPOINT(({x:.1},0.,{z:.1}));");
        let axis = id();
        let _ = writeln!(out, "#{axis}=IFCAXIS2PLACEMENT3D(#{origin},$,$);");
        let placement = id();
        let _ = writeln!(out, "#{placement}=IFCLOCALPLACEMENT($,#{axis});");

        let mut corners = [0u64; 8];
        for (i, c) in corners.iter_mut().enumerate() {
            *c = id();
            let (cx, cy, cz) = ((i & 1) as f64, ((i >> 1) & 1) as f64 * 3.0, ((i >> 2) & 1) as f64);
            let _ = writeln!(out, "#{c}=IFCCARTESIANPOINT(({cx:.1},{cy:.1},{cz:.1}));");
        }
        let quads = [[0, 1, 3, 2], [4, 6, 7, 5], [0, 4, 5, 1], [2, 3, 7, 6], [0, 2, 6, 4], [1, 5, 7, 3]];
        let mut faces = Vec::new();
        for quad in quads {
            let poly = id();
            let pts: Vec<String> = quad.iter().map(|q| format!("#{}", corners[*q])).collect();
            let _ = writeln!(out, "#{poly}=IFCPOLYLOOP(({}));", pts.join(","));
            let bound = id();
            let _ = writeln!(out, "#{bound}=IFCFACEOUTERBOUND(#{poly},.T.);");
            let face = id();
            let _ = writeln!(out, "#{face}=IFCFACE((#{bound}));");
            faces.push(format!("#{face}"));
        }
        let shell = id();
        let _ = writeln!(out, "#{shell}=IFCCLOSEDSHELL(({}));", faces.join(","));
        let brep = id();
        let _ = writeln!(out, "#{brep}=IFCFACETEDBREP(#{shell});");
        let rep = id();
        let _ = writeln!(out, "#{rep}=IFCSHAPEREPRESENTATION($,'Body','Brep',(#{brep}));");
        let shape = id();
        let _ = writeln!(out, "#{shape}=IFCPRODUCTDEFINITIONSHAPE($,$,(#{rep}));");

        let class = classes[count % classes.len()];
        let element = id();
        let _ = writeln!(
            out,
            "#{element}={class}('guid{count:08}',$,'Element {count}',$,$,#{placement},#{shape},$,$);"
        );

        let p1 = id();
        let _ = writeln!(out, "#{p1}=IFCPROPERTYSINGLEVALUE('IsExternal',$,IFCBOOLEAN(.T.),$);");
        let p2 = id();
        let _ = writeln!(out, "#{p2}=IFCPROPERTYSINGLEVALUE('Index',$,IFCINTEGER({count}),$);");
        let pset = id();
        let _ = writeln!(out, "#{pset}=IFCPROPERTYSET('pset{count}',$,'Pset_Common',$,(#{p1},#{p2}));");
        let rel = id();
        let _ = writeln!(
            out,
            "#{rel}=IFCRELDEFINESBYPROPERTIES('rel{count}',$,$,$,(#{element}),#{pset});"
        );
        count += 1;
    }
    out.push_str("ENDSEC;\nEND-ISO-10303-21;\n");
    (out.into_bytes(), count)
}

fn recording_options() -> (ConvertOptions, Arc<Mutex<Vec<Progress>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let options = ConvertOptions {
        progress_callback: Some(Box::new(move |p: &Progress| sink.lock().unwrap().push(*p))),
        runtime: RuntimeLocator::Builtin,
    };
    (options, seen)
}

#[test]
fn ten_megabyte_conversion_is_complete_and_deterministic() {
    let (ifc, elements) = synthetic_ifc(TEN_MB);
    assert!(ifc.len() >= TEN_MB);

    let (options, seen) = recording_options();
    let mut first = Converter::convert(ifc.clone(), options);
    assert!(first.wait().is_completed());
    let payload = first.take_output().unwrap();
    assert!(!payload.is_empty());

    let second = Converter::convert(ifc, ConvertOptions::default()).wait().clone();
    assert_eq!(second, JobOutcome::Completed(payload.clone()));

    let model = fragstream_format::decode(&payload).unwrap();
    assert_eq!(model.schema, "IFC4");
    assert_eq!(model.name, "Synthetic Tower");
    assert_eq!(model.element_count(), elements);
    // Six quads per element, two triangles each.
    assert_eq!(model.triangle_count(), elements * 12);
    assert!(model.batches.iter().all(|b| b.is_consistent()));
    assert!(model.elements.values().all(|e| e.batch.is_some()));

    let element = model.elements.values().next().unwrap();
    assert_eq!(
        element.properties["Pset_Common"]["IsExternal"],
        PropertyValue::Boolean(true)
    );

    let seen = seen.lock().unwrap();
    assert!(seen.windows(2).all(|w| w[0].value <= w[1].value));
    assert_eq!(seen.last().map(|p| p.value), Some(1.0));
    for stage in [
        Stage::Parsing,
        Stage::GeometryExtraction,
        Stage::PropertyExtraction,
        Stage::Serialization,
    ] {
        assert!(seen.iter().any(|p| p.stage == stage), "no progress for {stage}");
    }
}

#[test]
fn exactly_one_terminal_event() {
    let (ifc, _) = synthetic_ifc(64 * 1024);
    let finished = Arc::new(Mutex::new(Vec::new()));
    let sink = finished.clone();

    let mut job = Converter::convert(ifc, ConvertOptions::default());
    job.on_finished()
        .add(move |o: &JobOutcome| sink.lock().unwrap().push(o.is_completed()));
    while job.poll().is_none() {
        thread::sleep(Duration::from_millis(5));
    }
    job.poll();
    job.cancel();
    job.wait();

    assert_eq!(*finished.lock().unwrap(), vec![true]);
}

#[test]
fn cancel_mid_run_stops_progress_and_output() {
    let (ifc, _) = synthetic_ifc(TEN_MB);
    let (options, seen) = recording_options();
    let mut job = Converter::convert(ifc, options);

    while seen.lock().unwrap().is_empty() {
        assert!(job.poll().is_none(), "job ended before any progress");
        thread::sleep(Duration::from_millis(1));
    }
    job.cancel();
    let delivered = seen.lock().unwrap().len();

    thread::sleep(Duration::from_millis(100));
    assert_eq!(job.poll(), Some(&JobOutcome::Cancelled));
    assert_eq!(job.wait(), &JobOutcome::Cancelled);
    assert!(job.take_output().is_none());
    assert_eq!(seen.lock().unwrap().len(), delivered);
}

#[test]
fn cancel_after_worker_finished_still_cancels() {
    let (ifc, _) = synthetic_ifc(16 * 1024);
    let (options, seen) = recording_options();
    let mut job = Converter::convert(ifc, options);

    // Let the worker finish without delivering anything.
    thread::sleep(Duration::from_millis(500));
    job.cancel();

    assert_eq!(job.wait(), &JobOutcome::Cancelled);
    assert!(job.take_output().is_none());
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn parse_error_reports_line() {
    let (ifc, _) = synthetic_ifc(8 * 1024);
    let mut text = String::from_utf8(ifc).unwrap();
    let broken_line = text.lines().count() / 2;
    let offset: usize = text.lines().take(broken_line).map(|l| l.len() + 1).sum();
    text.insert_str(offset, "#99999999=IFCWALL(((;\n");

    let mut job = Converter::convert(text.into_bytes(), ConvertOptions::default());
    match job.wait() {
        JobOutcome::Failed(ConversionError::Parse { stage, line, .. }) => {
            assert_eq!(*stage, Stage::Parsing);
            assert_eq!(*line, broken_line + 1);
        }
        other => panic!("expected parse failure, got {other:?}"),
    }
}

#[test]
fn deeply_nested_input_fails_instead_of_overflowing() {
    let mut text = String::from("ISO-10303-21;\nHEADER;\nFILE_SCHEMA(('IFC4'));\nENDSEC;\nDATA;\n");
    text.push_str("#1=IFCWALL(");
    text.push_str(&"(".repeat(200_000));
    text.push_str(");\nENDSEC;\nEND-ISO-10303-21;\n");

    let mut job = Converter::convert(text.into_bytes(), ConvertOptions::default());
    match job.wait() {
        JobOutcome::Failed(ConversionError::Parse { stage, line, message }) => {
            assert_eq!(*stage, Stage::Parsing);
            assert_eq!(*line, 6);
            assert!(message.contains("nesting"), "{message}");
        }
        other => panic!("expected parse failure, got {other:?}"),
    }
    assert!(job.take_output().is_none());
}

#[test]
fn custom_runtime_limits_products() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("walls.json");
    std::fs::write(
        &path,
        r#"{"name":"walls","schemas":["IFC4"],"product_classes":["IFCWALL"]}"#,
    )
    .unwrap();

    let (ifc, count) = synthetic_ifc(32 * 1024);
    let mut job = Converter::convert(
        ifc,
        ConvertOptions {
            runtime: RuntimeLocator::Path(path),
            ..ConvertOptions::default()
        },
    );
    let payload = match job.wait() {
        JobOutcome::Completed(payload) => payload.clone(),
        other => panic!("conversion failed: {other:?}"),
    };
    let model = fragstream_format::decode(&payload).unwrap();
    assert_eq!(model.element_count(), count.div_ceil(3));
    assert!(model.elements.values().all(|e| e.class == "IFCWALL"));
}
