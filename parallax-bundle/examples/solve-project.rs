//! Load a project from its JSON persistence form, run the full solve, and
//! print the report.
//!
//! ```text
//! cargo run --example solve-project -- scene.json
//! ```

use parallax_bundle::{solve, Flow};
use parallax_types::dto::{project_from_json, project_to_json};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .ok_or("usage: solve-project <project.json>")?;
    let json = std::fs::read_to_string(&path)?;
    let mut project = project_from_json(&json)?;

    let options = project.options.clone();
    let mut on_progress = |iteration: usize, cost: f64, best: f64| {
        eprintln!("iteration {iteration}: cost {cost:.6e} (best {best:.6e})");
        Flow::Continue
    };
    let report = solve(&mut project, &options, Some(&mut on_progress));

    eprintln!(
        "quality {:?}, median reprojection {:?} px, {} iterations, {:.1} ms",
        report.quality, report.median_reprojection_error, report.iterations, report.elapsed_ms
    );
    if let Some(error) = &report.error {
        eprintln!("solve error: {error}");
    }

    // The solved project, ready to persist.
    println!("{}", project_to_json(&project)?);
    Ok(())
}
