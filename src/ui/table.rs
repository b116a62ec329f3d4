use crate::Result;
use comfy_table::{ContentArrangement, Table};

/// Borderless table; the header is shown only to a person at a terminal.
pub fn new_table(header: &[&str], hide_header: bool) -> Table {
    let mut table = Table::new();
    table
        .load_preset(comfy_table::presets::NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic);
    if !hide_header && console::user_attended() {
        table.set_header(header.to_vec());
    }
    table
}

pub fn print_table(table: Table) -> Result<()> {
    for line in table.to_string().lines() {
        println!("{}", line.trim_end());
    }
    Ok(())
}
