use etlweather::{config::ConnectionSpec, dataset::TableContents, store};
use std::{env, process::exit};

/// Rows printed before the listing is cut short.
const PREVIEW_ROWS: usize = 20;

fn main() {
    // Expect exactly two CLI arguments: a connection URI and a table name.
    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        eprintln!("Usage: {} <CONNECTION_URI> <TABLE>", args[0]);
        eprintln!("  e.g. {} duckdb:etlweather.duckdb new_dag_data", args[0]);
        exit(1);
    }
    if let Err(e) = inspect(&args[1], &args[2]) {
        eprintln!("Error: {:#}", e);
        exit(1);
    }
}

/// Open the destination, read the table and print its columns and first rows.
fn inspect(uri: &str, table: &str) -> anyhow::Result<()> {
    let spec = ConnectionSpec::parse(uri)?;
    let connector = store::connector_for(&spec);

    let Some(contents) = store::read_table(connector.as_ref(), table)? else {
        println!("table `{}` does not exist in {}", table, connector.describe());
        return Ok(());
    };

    println!("=== {} / {} ===", connector.describe(), table);
    println!("Total rows:    {}", contents.num_rows());
    println!("Columns:       {}", contents.columns.len());
    println!();
    print_rows(&contents);
    Ok(())
}

fn print_rows(contents: &TableContents) {
    let cells: Vec<Vec<String>> = contents
        .rows
        .iter()
        .take(PREVIEW_ROWS)
        .map(|row| row.iter().map(|c| c.to_string()).collect())
        .collect();

    let widths: Vec<usize> = contents
        .columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            cells
                .iter()
                .map(|r| r[i].len())
                .chain(std::iter::once(name.len()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |values: Vec<&str>| {
        let padded: Vec<String> = values
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!("{:<width$}", v, width = *w))
            .collect();
        println!("| {} |", padded.join(" | "));
    };

    line(contents.columns.iter().map(String::as_str).collect());
    println!(
        "|{}|",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("|")
    );
    for row in &cells {
        line(row.iter().map(String::as_str).collect());
    }
    if contents.num_rows() > PREVIEW_ROWS {
        println!("… {} more rows", contents.num_rows() - PREVIEW_ROWS);
    }
}
