use std::fmt::Write as _;
use std::hint::black_box;
use std::time::Instant;

use fragstream_convert::{ConvertOptions, Converter, step};

/// A flat grid of single-triangle columns, `count` of them.
fn make_ifc(count: usize) -> Vec<u8> {
    let mut out = String::from(
        "ISO-10303-21;\nHEADER;\nFILE_SCHEMA(('IFC4'));\nENDSEC;\nDATA;\n\
         #1=IFCPROJECT('p',$,'Bench',$,$,$,$,$,$);\n",
    );
    let mut id = 10u64;
    for i in 0..count {
        let x = (i % 200) as f32 * 2.0;
        let z = (i / 200) as f32 * 2.0;
        let base = id;
        let _ = writeln!(out, "#{}=IFCCARTESIANPOINT(({x:.1},0.,{z:.1}));", base);
        let _ = writeln!(out, "#{}=IFCCARTESIANPOINT(({:.1},0.,{z:.1}));", base + 1, x + 1.0);
        let _ = writeln!(out, "#{}=IFCCARTESIANPOINT(({x:.1},3.,{z:.1}));", base + 2);
        let _ = writeln!(out, "#{}=IFCPOLYLOOP((#{},#{},#{}));", base + 3, base, base + 1, base + 2);
        let _ = writeln!(out, "#{}=IFCFACEOUTERBOUND(#{},.T.);", base + 4, base + 3);
        let _ = writeln!(out, "#{}=IFCFACE((#{}));", base + 5, base + 4);
        let _ = writeln!(out, "#{}=IFCSHAPEREPRESENTATION($,'Body','Brep',(#{}));", base + 6, base + 5);
        let _ = writeln!(out, "#{}=IFCPRODUCTDEFINITIONSHAPE($,$,(#{}));", base + 7, base + 6);
        let _ = writeln!(out, "#{}=IFCCOLUMN('c{i}',$,$,$,$,$,#{},$,$);", base + 8, base + 7);
        id += 9;
    }
    out.push_str("ENDSEC;\nEND-ISO-10303-21;\n");
    out.into_bytes()
}

fn bench_parse(count: usize, iterations: usize) {
    let bytes = make_ifc(count);
    let start = Instant::now();
    for _ in 0..iterations {
        let _ = black_box(step::parse(black_box(&bytes), &mut |_| true));
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!(
        "  parse ({count} elements, {} KiB, {iterations} iters): {per_iter:?}/iter, total {elapsed:?}",
        bytes.len() / 1024
    );
}

fn bench_convert(count: usize, iterations: usize) {
    let bytes = make_ifc(count);
    let start = Instant::now();
    let mut payload_len = 0;
    for _ in 0..iterations {
        let mut job = Converter::convert(bytes.clone(), ConvertOptions::default());
        job.wait();
        payload_len = job.take_output().map_or(0, |p| p.len());
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!(
        "  convert ({count} elements, payload {payload_len} B, {iterations} iters): {per_iter:?}/iter, total {elapsed:?}"
    );
}

fn main() {
    println!("=== fragstream-convert benchmarks ===\n");

    println!("STEP parse:");
    bench_parse(1_000, 20);
    bench_parse(10_000, 5);
    bench_parse(50_000, 2);

    println!("\nFull conversion:");
    bench_convert(1_000, 10);
    bench_convert(10_000, 3);
    bench_convert(50_000, 1);

    println!("\nDone.");
}
