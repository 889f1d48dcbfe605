//! Well-known app display names and their Android package names.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Apps listed in the system prompt, in display order.
pub const PROMPT_APPS: &[(&str, &str)] = &[
    ("美团", "com.sankuai.meituan"),
    ("淘宝", "com.taobao.taobao"),
    ("微信", "com.tencent.mm"),
    ("支付宝", "com.eg.android.AlipayGphone"),
    ("Chrome", "com.android.chrome"),
    ("Settings", "com.android.settings"),
];

const KNOWN_APPS: &[(&str, &str)] = &[
    // Social & messaging
    ("qq", "com.tencent.mobileqq"),
    ("微博", "com.sina.weibo"),
    ("小红书", "com.xingin.xhs"),
    ("知乎", "com.zhihu.android"),
    // Shopping & food
    ("京东", "com.jingdong.app.mall"),
    ("拼多多", "com.xunmeng.pinduoduo"),
    ("大众点评", "com.dianping.v1"),
    ("饿了么", "me.ele"),
    // Travel & maps
    ("高德地图", "com.autonavi.minimap"),
    ("百度地图", "com.baidu.BaiduMap"),
    ("携程", "ctrip.android.view"),
    ("12306", "com.MobileTicket"),
    ("滴滴出行", "com.sdu.did.psnger"),
    ("google maps", "com.google.android.apps.maps"),
    // Video & music
    ("bilibili", "tv.danmaku.bili"),
    ("抖音", "com.ss.android.ugc.aweme"),
    ("快手", "com.smile.gifmaker"),
    ("网易云音乐", "com.netease.cloudmusic"),
    ("youtube", "com.google.android.youtube"),
    // System & tools
    ("gmail", "com.google.android.gm"),
    ("clock", "com.android.deskclock"),
    ("contacts", "com.android.contacts"),
    ("camera", "com.android.camera"),
    ("calculator", "com.android.calculator2"),
    ("calendar", "com.android.calendar"),
    ("messages", "com.android.mms"),
    ("phone", "com.android.dialer"),
];

/// Lower-cased display name to package name.
pub static APP_PACKAGES: Lazy<HashMap<String, &'static str>> = Lazy::new(|| {
    PROMPT_APPS
        .iter()
        .chain(KNOWN_APPS)
        .map(|(name, package)| (name.to_lowercase(), *package))
        .collect()
});

/// Get the package name for an app by its display name. Case-insensitive.
pub fn get_package(app_name: &str) -> Option<&'static str> {
    APP_PACKAGES.get(&app_name.trim().to_lowercase()).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_package() {
        assert_eq!(get_package("微信"), Some("com.tencent.mm"));
        assert_eq!(get_package("chrome"), Some("com.android.chrome"));
        assert_eq!(get_package(" YouTube "), Some("com.google.android.youtube"));
        assert_eq!(get_package("NonExistent"), None);
    }
}
