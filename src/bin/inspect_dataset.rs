use anyhow::{Context, Result};
use arrow::array::{Array, BooleanArray};
use arrow::ipc::reader::FileReaderBuilder;
use std::fs::File;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        println!("Usage: {} <dataset.feather>", args[0]);
        std::process::exit(1);
    }

    let file = File::open(&args[1]).with_context(|| format!("Failed to open {}", args[1]))?;
    let reader = FileReaderBuilder::new().build(file)?;

    println!("\nSchema:");
    for field in reader.schema().fields() {
        println!(
            "  {:<28} {:?}{}",
            field.name(),
            field.data_type(),
            if field.is_nullable() { " (nullable)" } else { "" }
        );
    }

    let mut rows = 0;
    let mut sleeping = 0;
    for batch in reader {
        let batch = batch?;
        rows += batch.num_rows();
        if let Some(labels) = batch
            .column_by_name("is_sleeping")
            .and_then(|c| c.as_any().downcast_ref::<BooleanArray>())
        {
            sleeping += labels.true_count();
            if labels.null_count() > 0 {
                println!("Warning: {} unlabeled rows", labels.null_count());
            }
        }
    }

    println!("\nRows: {}", rows);
    println!("Sleeping: {} ({} awake)", sleeping, rows - sleeping);

    Ok(())
}
