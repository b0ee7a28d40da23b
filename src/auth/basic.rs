use base64::Engine;
use subtle::ConstantTimeEq;

use super::RejectReason;

/// HTTP Basic credentials checked in constant time.
#[derive(Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl BasicAuth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Checks an `Authorization` header value.
    pub fn check(&self, header: Option<&str>) -> Result<(), RejectReason> {
        let auth_str = header.ok_or(RejectReason::MissingCredentials)?;

        let (scheme, encoded) = auth_str
            .trim()
            .split_once(' ')
            .ok_or(RejectReason::InvalidScheme)?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(RejectReason::InvalidScheme);
        }

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| RejectReason::MalformedCredentials)?;
        let credentials =
            String::from_utf8(decoded).map_err(|_| RejectReason::MalformedCredentials)?;
        let (username, password) = credentials
            .split_once(':')
            .ok_or(RejectReason::MalformedCredentials)?;

        // Both comparisons always run; `&` on Choice does not short-circuit.
        let user_ok = username.as_bytes().ct_eq(self.username.as_bytes());
        let pass_ok = password.as_bytes().ct_eq(self.password.as_bytes());
        if bool::from(user_ok & pass_ok) {
            Ok(())
        } else {
            Err(RejectReason::BadCredentials)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn header(user: &str, pass: &str) -> String {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        format!("Basic {encoded}")
    }

    #[test]
    fn test_valid_credentials() {
        let auth = BasicAuth::new("terraform".into(), "hunter2".into());
        assert_eq!(auth.check(Some(&header("terraform", "hunter2"))), Ok(()));
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        let auth = BasicAuth::new("terraform".into(), "hunter2".into());
        let value = header("terraform", "hunter2").replacen("Basic", "bAsIc", 1);
        assert_eq!(auth.check(Some(&value)), Ok(()));
    }

    #[test]
    fn test_password_may_contain_colon() {
        let auth = BasicAuth::new("ci".into(), "a:b:c".into());
        assert_eq!(auth.check(Some(&header("ci", "a:b:c"))), Ok(()));
        assert_eq!(
            auth.check(Some(&header("ci", "a:b"))),
            Err(RejectReason::BadCredentials)
        );
    }

    #[test]
    fn test_rejections() {
        let auth = BasicAuth::new("terraform".into(), "hunter2".into());
        assert_eq!(auth.check(None), Err(RejectReason::MissingCredentials));
        assert_eq!(
            auth.check(Some("Bearer abc")),
            Err(RejectReason::InvalidScheme)
        );
        assert_eq!(auth.check(Some("Basic")), Err(RejectReason::InvalidScheme));
        assert_eq!(
            auth.check(Some("Basic !!!not-base64!!!")),
            Err(RejectReason::MalformedCredentials)
        );
        let no_colon = base64::engine::general_purpose::STANDARD.encode("terraform");
        assert_eq!(
            auth.check(Some(&format!("Basic {no_colon}"))),
            Err(RejectReason::MalformedCredentials)
        );
        assert_eq!(
            auth.check(Some(&header("terraform", "hunter3"))),
            Err(RejectReason::BadCredentials)
        );
        assert_eq!(
            auth.check(Some(&header("terraforn", "hunter2"))),
            Err(RejectReason::BadCredentials)
        );
    }

    #[test]
    fn test_debug_redacts_password() {
        let auth = BasicAuth::new("terraform".into(), "hunter2".into());
        let rendered = format!("{auth:?}");
        assert!(rendered.contains("terraform"));
        assert!(!rendered.contains("hunter2"));
    }

    fn median_check_time(auth: &BasicAuth, value: &str) -> Duration {
        const ROUNDS: usize = 31;
        const ITERATIONS: usize = 200;
        let mut samples = Vec::with_capacity(ROUNDS);
        for _ in 0..ROUNDS {
            let start = Instant::now();
            for _ in 0..ITERATIONS {
                let _ = std::hint::black_box(auth.check(Some(std::hint::black_box(value))));
            }
            samples.push(start.elapsed());
        }
        samples.sort();
        samples[ROUNDS / 2]
    }

    #[test]
    fn test_mismatch_position_does_not_change_timing() {
        let password: String = "p".repeat(4096);
        let auth = BasicAuth::new("terraform".into(), password.clone());

        let correct = header("terraform", &password);
        let mut early = password.clone().into_bytes();
        early[0] = b'x';
        let early = header("terraform", std::str::from_utf8(&early).unwrap());
        let mut late = password.clone().into_bytes();
        late[4095] = b'x';
        let late = header("terraform", std::str::from_utf8(&late).unwrap());

        // warm up
        median_check_time(&auth, &correct);

        let t_correct = median_check_time(&auth, &correct).as_secs_f64();
        let t_early = median_check_time(&auth, &early).as_secs_f64();
        let t_late = median_check_time(&auth, &late).as_secs_f64();

        for t in [t_early, t_late] {
            let ratio = t / t_correct;
            assert!(
                (0.33..3.0).contains(&ratio),
                "timing ratio {ratio} outside bound (correct {t_correct}s, other {t}s)"
            );
        }
    }
}
