use crate::autoscheduler::SearchReport;
use crate::color::do_color;
use crate::evaluator::ModelEvaluator;
use crate::syntax::{Node, SyntaxTree};
use crate::utils::indent;

use clap::ValueEnum;
use prettytable::{self, format, row, Cell};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum TreePrintStyle {
    Full,
    Compact,
}

/// Pretty-print a [SyntaxTree] to stdout.
pub fn pprint_tree(tree: &SyntaxTree, style: TreePrintStyle) {
    pprint_table(tree, style).printstd()
}

/// Pretty-print a [SyntaxTree] to a given [fmt::Write].
pub fn pprint_write<W: fmt::Write>(
    out: &mut W,
    tree: &SyntaxTree,
    style: TreePrintStyle,
) -> fmt::Result {
    write!(out, "{}", pprint_table(tree, style))
}

pub fn pprint_string(tree: &SyntaxTree, style: TreePrintStyle) -> String {
    format!("{}", pprint_table(tree, style))
}

pub fn pprint_report(report: &SearchReport) {
    let mut table = prettytable::Table::new();
    table.set_titles(row!["Search", ""]);
    let rows = [
        ("Method", report.method.to_owned()),
        ("Evaluator", report.evaluator.clone()),
        ("Explored", report.explored.to_string()),
        ("Discarded", report.discarded.to_string()),
        ("Best evaluation", format!("{:.4}", report.best_evaluation)),
        ("Baseline time (ms)", format!("{:.4}", report.baseline_time)),
        ("Search time", format!("{:.2?}", report.search_time)),
        ("Transformations", report.best_schedule.len().to_string()),
    ];
    for (label, value) in rows {
        table.add_row(row![label, value]);
    }
    table.set_format(plain_format());
    table.printstd();
}

fn pprint_table(tree: &SyntaxTree, style: TreePrintStyle) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    let titles = match style {
        TreePrintStyle::Full => row!["Loop nest", "Model cost", "Share"],
        TreePrintStyle::Compact => row!["Loop nest"],
    };
    table.set_titles(titles);

    // Costs are only annotations; a tree the model cannot estimate still prints.
    let costs = match style {
        TreePrintStyle::Full => ModelEvaluator::default().node_costs(tree).ok(),
        TreePrintStyle::Compact => None,
    };
    let total: f64 = match &costs {
        Some(costs) => {
            let mut idx = 0;
            tree.roots()
                .iter()
                .map(|node| {
                    let c = costs[idx];
                    idx += subtree_size(node);
                    c
                })
                .sum()
        }
        None => 0.0,
    };

    let mut idx = 0;
    for node in tree.roots() {
        pprint_inner(&mut table, tree, node, 0, &mut idx, costs.as_deref(), total, style);
    }

    table.set_format(plain_format());
    table
}

#[allow(clippy::too_many_arguments)]
fn pprint_inner(
    table: &mut prettytable::Table,
    tree: &SyntaxTree,
    node: &Node,
    depth: usize,
    idx: &mut usize,
    costs: Option<&[f64]>,
    total: f64,
    style: TreePrintStyle,
) {
    let main_str = format!("{}{}", indent(depth), node.header(tree.program()));
    let r = match (style, costs) {
        (TreePrintStyle::Full, Some(costs)) => {
            let cost = costs[*idx];
            let share = if total > 0.0 { 100.0 * cost / total } else { 0.0 };
            let mut share_cell = Cell::new(&format!("{share:>5.1}%"));
            if do_color() && share >= 50.0 {
                share_cell = share_cell.style_spec("Fy");
            }
            let mut r = row![main_str, format!("{cost:.0}")];
            r.add_cell(share_cell);
            r
        }
        (TreePrintStyle::Full, None) => row![main_str, "", ""],
        (TreePrintStyle::Compact, _) => row![main_str],
    };
    table.add_row(r);
    *idx += 1;

    if let Node::Loop(l) = node {
        for child in &l.children {
            pprint_inner(table, tree, child, depth + 1, idx, costs, total, style);
        }
    }
}

fn subtree_size(node: &Node) -> usize {
    match node {
        Node::Loop(l) => 1 + l.children.iter().map(subtree_size).sum::<usize>(),
        Node::Leaf(_) => 1,
    }
}

fn plain_format() -> format::TableFormat {
    format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build()
}
