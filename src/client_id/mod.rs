
use rand::rngs::OsRng;
use rand::Rng;

const CLIENT_ID_DIGITS: usize = 9;

/// Generates the process-unique client id: 9 decimal digits from the OS RNG.
///
/// The id is not a secret; it is the rendezvous key and the tie-breaker in
/// role election.
pub fn generate_client_id() -> String {
    let mut id = String::with_capacity(CLIENT_ID_DIGITS);
    for _ in 0..CLIENT_ID_DIGITS {
        let digit: u8 = OsRng.gen_range(0..10);
        id.push(char::from(b'0' + digit));
    }
    id
}

/// Groups a 9-digit id as `NNN NNN NNN` for display. The wire form stays
/// digits-only; anything that is not 9 characters long passes through.
pub fn format_client_id(id: &str) -> String {
    if id.len() != CLIENT_ID_DIGITS {
        return id.to_owned();
    }
    format!("{} {} {}", &id[0..3], &id[3..6], &id[6..9])
}
