// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Reads a graph description from a file, sums the values of every node
//! reachable from node 0 on a worker pool, and prints the sum.

use std::env;
use std::fs::File;
use std::io::BufReader;
use std::process;
use std::sync::Arc;

use quiesce::graph::{Graph, Traversal};
use quiesce::Pool;

const NUM_WORKERS: usize = 4;

fn main() {
    let path = match env::args().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("usage: graph_sum <input-file>");
            process::exit(1);
        }
    };

    let file = match File::open(&path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("graph_sum: {}: {}", path, err);
            process::exit(1);
        }
    };

    let graph = match Graph::from_reader(BufReader::new(file)) {
        Ok(graph) => graph,
        Err(err) => {
            eprintln!("graph_sum: {}: {}", path, err);
            process::exit(1);
        }
    };

    if graph.node_count() == 0 {
        println!("0");
        return;
    }

    let traversal = Arc::new(Traversal::new(graph));
    let pool = Pool::new(NUM_WORKERS, Arc::clone(&traversal));
    pool.spawn(0);
    pool.join();

    println!("{}", traversal.sum());
}
