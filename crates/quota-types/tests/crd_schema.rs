//! Checks over the generated CRD manifests: naming, scope, and the
//! map-list declarations that the field-scoped patch discipline of the
//! controllers relies on.

use kube::CustomResourceExt;
use quota_types::{
    bucket::AllowanceBucket,
    claim::ResourceClaim,
    grant::ResourceGrant,
    policy::{ClaimCreationPolicy, GrantCreationPolicy},
    registration::ResourceRegistration,
};

fn crd_json<K: CustomResourceExt>() -> serde_json::Value {
    serde_json::to_value(K::crd()).expect("CRD is serializable")
}

#[test]
fn all_kinds_live_in_the_quota_group_at_v1alpha1() {
    for crd in [
        crd_json::<ResourceRegistration>(),
        crd_json::<ResourceGrant>(),
        crd_json::<ResourceClaim>(),
        crd_json::<AllowanceBucket>(),
        crd_json::<ClaimCreationPolicy>(),
        crd_json::<GrantCreationPolicy>(),
    ] {
        assert_eq!(crd["spec"]["group"], "quota.miloapis.com");
        assert_eq!(crd["spec"]["versions"][0]["name"], "v1alpha1");
        assert_eq!(crd["spec"]["versions"][0]["served"], true);
    }
}

#[test]
fn scopes_match_the_data_model() {
    for (crd, scope) in [
        (crd_json::<ResourceRegistration>(), "Cluster"),
        (crd_json::<ClaimCreationPolicy>(), "Cluster"),
        (crd_json::<GrantCreationPolicy>(), "Cluster"),
        (crd_json::<ResourceGrant>(), "Namespaced"),
        (crd_json::<ResourceClaim>(), "Namespaced"),
        (crd_json::<AllowanceBucket>(), "Namespaced"),
    ] {
        assert_eq!(crd["spec"]["scope"], scope, "{}", crd["spec"]["names"]["kind"]);
    }
}

#[test]
fn plural_names_are_stable() {
    assert_eq!(
        crd_json::<ResourceRegistration>()["spec"]["names"]["plural"],
        "resourceregistrations"
    );
    assert_eq!(crd_json::<AllowanceBucket>()["spec"]["names"]["plural"], "allowancebuckets");
    assert_eq!(crd_json::<ResourceClaim>()["spec"]["names"]["plural"], "resourceclaims");
}

#[test]
fn claim_allocations_merge_by_resource_type() {
    let crd = crd_json::<ResourceClaim>();
    let allocations = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]
        ["status"]["properties"]["allocations"];

    assert_eq!(allocations["x-kubernetes-list-type"], "map");
    assert_eq!(
        allocations["x-kubernetes-list-map-keys"],
        serde_json::json!(["resourceType"])
    );
}

#[test]
fn condition_lists_merge_by_type() {
    let crd = crd_json::<ResourceClaim>();
    let conditions = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]
        ["status"]["properties"]["conditions"];

    assert_eq!(conditions["x-kubernetes-list-type"], "map");
    assert_eq!(
        conditions["x-kubernetes-list-map-keys"],
        serde_json::json!(["type"])
    );
}

#[test]
fn bucket_status_carries_the_aggregate_fields() {
    let crd = crd_json::<AllowanceBucket>();
    let status = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]["status"]
        ["properties"];

    for field in ["limit", "allocated", "available", "claimCount", "grantCount"] {
        assert!(
            !status[field].is_null(),
            "bucket status schema is missing {field}"
        );
    }
}
