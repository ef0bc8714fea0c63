use std::time::Duration;
use std::time::Instant;

use crate::lease::Lease;
use crate::lease::LeaseState;

const MAX_LEASE: Duration = Duration::from_millis(250);

#[test]
fn test_new_lease_is_expired() {
    let lease = Lease::new(MAX_LEASE);
    assert_eq!(lease.inspect(None), LeaseState::Expired);
}

#[test]
fn test_renew_and_inspect() {
    let mut lease = Lease::new(MAX_LEASE);
    let now = Instant::now();
    lease.renew(now);
    assert_eq!(lease.inspect(Some(now)), LeaseState::Valid);
    assert_eq!(
        lease.inspect(Some(now + MAX_LEASE - Duration::from_millis(1))),
        LeaseState::Valid
    );
    assert_eq!(lease.inspect(Some(now + MAX_LEASE)), LeaseState::Expired);
}

#[test]
fn test_renew_never_shortens_the_bound() {
    let mut lease = Lease::new(MAX_LEASE);
    let now = Instant::now();
    lease.renew(now);
    // A renewal from an older send timestamp must not move the bound back.
    lease.renew(now - Duration::from_millis(200));
    assert_eq!(
        lease.inspect(Some(now + Duration::from_millis(200))),
        LeaseState::Valid
    );
}

#[test]
fn test_suspect_is_sticky() {
    let mut lease = Lease::new(MAX_LEASE);
    let now = Instant::now();
    lease.suspect(now);
    assert_eq!(lease.inspect(Some(now)), LeaseState::Suspect);
    // Probing way past the suspect bound still answers suspect.
    assert_eq!(
        lease.inspect(Some(now + Duration::from_secs(10))),
        LeaseState::Suspect
    );
    // A renewal that does not outlast the suspect bound is ignored.
    lease.renew(now - Duration::from_millis(1));
    assert_eq!(lease.inspect(Some(now)), LeaseState::Suspect);
    // A later renewal clears the suspicion.
    lease.renew(now + Duration::from_millis(5));
    assert_eq!(lease.inspect(Some(now)), LeaseState::Valid);
}

#[test]
fn test_expire() {
    let mut lease = Lease::new(MAX_LEASE);
    let now = Instant::now();
    lease.renew(now);
    lease.expire();
    assert_eq!(lease.inspect(Some(now)), LeaseState::Expired);
}

#[test]
fn test_remote_lease_publication() {
    let mut lease = Lease::new(MAX_LEASE);
    let now = Instant::now();
    lease.renew(now);

    let remote = lease.maybe_new_remote_lease(7).expect("first publication");
    assert_eq!(remote.term(), 7);
    assert_eq!(remote.inspect(Some(now)), LeaseState::Valid);
    assert_eq!(remote.inspect(Some(now + MAX_LEASE)), LeaseState::Expired);

    // Already published for this term.
    assert!(lease.maybe_new_remote_lease(7).is_none());

    // Renewal pushes the remote bound forward as well.
    lease.renew(now + Duration::from_millis(100));
    assert_eq!(
        remote.inspect(Some(now + MAX_LEASE + Duration::from_millis(50))),
        LeaseState::Valid
    );

    // Expiry is visible to the remote handle immediately.
    lease.expire();
    assert_eq!(remote.inspect(Some(now)), LeaseState::Expired);
}

#[test]
fn test_suspect_expires_remote() {
    let mut lease = Lease::new(MAX_LEASE);
    let now = Instant::now();
    lease.renew(now);
    let remote = lease.maybe_new_remote_lease(3).expect("publication");
    assert_eq!(remote.inspect(Some(now)), LeaseState::Valid);

    lease.suspect(now);
    assert_eq!(remote.inspect(Some(now)), LeaseState::Expired);
    assert_eq!(lease.inspect(Some(now)), LeaseState::Suspect);
}

#[test]
fn test_remote_lease_without_valid_bound_is_expired() {
    let mut lease = Lease::new(MAX_LEASE);
    let remote = lease.maybe_new_remote_lease(1).expect("publication");
    assert_eq!(remote.inspect(None), LeaseState::Expired);
}

#[test]
fn test_new_remote_lease_after_expiry_uses_new_term() {
    let mut lease = Lease::new(MAX_LEASE);
    let now = Instant::now();
    lease.renew(now);
    let old = lease.maybe_new_remote_lease(3).expect("publication");
    lease.expire();

    lease.renew(now + Duration::from_millis(10));
    let new = lease.maybe_new_remote_lease(4).expect("re-publication");
    assert_eq!(new.term(), 4);
    assert_eq!(new.inspect(Some(now)), LeaseState::Valid);
    // The withdrawn handle never comes back to life.
    assert_eq!(old.inspect(Some(now)), LeaseState::Expired);
}
