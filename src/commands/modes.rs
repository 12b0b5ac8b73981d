use crate::mode::Mode;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, Color, ContentArrangement, Table};

pub fn table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["MODE", "FILE", "DESCRIPTION"]);

    for mode in Mode::ALL {
        table.add_row(vec![
            Cell::new(mode.name()).fg(Color::Cyan),
            Cell::new(mode.file_name()),
            Cell::new(mode.description()),
        ]);
    }
    table
}

/// Run the modes command
pub fn run() {
    println!("{}", table());
}
