fn main() {
    let date = time_now();
    println!("cargo:rustc-env=BUILD_DATE={date}");
}

fn time_now() -> String {
    // Use SOURCE_DATE_EPOCH for reproducible builds, otherwise current time
    if let Ok(epoch) = std::env::var("SOURCE_DATE_EPOCH") {
        return epoch_to_date(&epoch);
    }

    let output = std::process::Command::new("date")
        .args(["+%Y-%m-%d"])
        .output()
        .expect("failed to run date");
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

fn epoch_to_date(epoch: &str) -> String {
    let output = std::process::Command::new("date")
        .args(["-d", &format!("@{epoch}"), "+%Y-%m-%d"])
        .output()
        .expect("failed to run date");
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}
