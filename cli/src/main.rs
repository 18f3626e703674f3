// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod cli;
mod commands;
mod editor;
mod error;
mod validate;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    env_logger::init();
    std::process::exit(match cli::run_cli().await {
        Ok(_) => 0,
        Err(err) => {
            eprintln!("error: {err}");
            1
        }
    });
}
